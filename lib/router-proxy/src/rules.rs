//! Route rules mapping request paths to logical service names

use crate::error::{ProxyError, Result};
use registry_core::normalize_service_name;
use serde::{Deserialize, Serialize};

/// One segment of a path pattern
#[derive(Clone, Debug, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*`: exactly one segment
    Single,
    /// `**`: zero or more trailing segments
    Rest,
}

/// Segment based path pattern such as `/api/orders/**`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let parts = split_segments(raw);
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "**" if i + 1 == parts.len() => PatternSegment::Rest,
                "**" => return Err(invalid("'**' is only allowed as the last segment")),
                "*" => PatternSegment::Single,
                literal if literal.contains('*') => {
                    return Err(invalid("wildcards must occupy a whole segment"))
                }
                literal => PatternSegment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a request path (without query string)
    pub fn matches(&self, path: &str) -> bool {
        let parts = split_segments(path);
        let mut parts = parts.iter();

        for segment in &self.segments {
            match segment {
                PatternSegment::Rest => return true,
                PatternSegment::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                PatternSegment::Literal(literal) => match parts.next() {
                    Some(part) if *part == literal.as_str() => {}
                    _ => return false,
                },
            }
        }

        parts.next().is_none()
    }
}

/// How the matched path is rewritten before forwarding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathRewrite {
    /// Forward the path unchanged
    #[default]
    None,
    /// Drop the first N path segments
    StripPrefix(usize),
    /// Swap a leading path prefix for another
    ReplacePrefix { prefix: String, replacement: String },
}

impl PathRewrite {
    pub fn apply(&self, path: &str) -> String {
        match self {
            PathRewrite::None => ensure_leading_slash(path),
            PathRewrite::StripPrefix(count) => {
                let parts = split_segments(path);
                if *count >= parts.len() {
                    return "/".to_string();
                }
                let mut rewritten = format!("/{}", parts[*count..].join("/"));
                if path.ends_with('/') {
                    rewritten.push('/');
                }
                rewritten
            }
            PathRewrite::ReplacePrefix {
                prefix,
                replacement,
            } => {
                let prefix = prefix.trim_end_matches('/');
                match path.strip_prefix(prefix) {
                    // Only replace on a segment boundary
                    Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                        let replacement = replacement.trim_end_matches('/');
                        ensure_leading_slash(&format!("{}{}", replacement, rest))
                    }
                    _ => ensure_leading_slash(path),
                }
            }
        }
    }
}

/// A configured routing rule
#[derive(Clone, Debug)]
pub struct RouteRule {
    pub pattern: PathPattern,
    pub target_service: String,
    pub rewrite: PathRewrite,
}

impl RouteRule {
    pub fn new(pattern: &str, target_service: &str, rewrite: PathRewrite) -> Result<Self> {
        if target_service.trim().is_empty() {
            return Err(ProxyError::InvalidConfiguration(format!(
                "route {} has an empty target service",
                pattern
            )));
        }
        Ok(Self {
            pattern: PathPattern::parse(pattern)?,
            target_service: normalize_service_name(target_service),
            rewrite,
        })
    }
}

/// Outcome of routing a request path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    pub service: String,
    pub upstream_path: String,
    /// Pattern that matched, or `discovery` for locator routes
    pub route: String,
}

pub const DISCOVERY_ROUTE: &str = "discovery";

impl RouteMatch {
    /// Service name came from the client's path rather than a configured rule
    pub fn is_discovery(&self) -> bool {
        self.route == DISCOVERY_ROUTE
    }
}

/// Ordered rules, first match wins
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    discovery_locator: bool,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self {
            rules,
            discovery_locator: false,
        }
    }

    /// Fall back to `/{service-name}/**` routing when no rule matches
    pub fn with_discovery_locator(mut self, enabled: bool) -> Self {
        self.discovery_locator = enabled;
        self
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn route(&self, path: &str) -> Option<RouteMatch> {
        if let Some(rule) = self.rules.iter().find(|rule| rule.pattern.matches(path)) {
            return Some(RouteMatch {
                service: rule.target_service.clone(),
                upstream_path: rule.rewrite.apply(path),
                route: rule.pattern.as_str().to_string(),
            });
        }

        if self.discovery_locator {
            let first = split_segments(path).first().copied()?;
            return Some(RouteMatch {
                service: normalize_service_name(first),
                upstream_path: PathRewrite::StripPrefix(1).apply(path),
                route: DISCOVERY_ROUTE.to_string(),
            });
        }

        None
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
