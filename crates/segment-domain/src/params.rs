//! The closed set of asset kinds and their typed, per-slug parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParamsError;
use crate::hashing::hash_parts_v1;
use crate::ids::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSlug {
    SegmentSpecifiedUsers,
    SegmentFollowers,
    SegmentFollowed,
    SegmentMutuals,
    SegmentUnreciprocatedFollowed,
    PostCorpusForSegment,
}

impl AssetSlug {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSlug::SegmentSpecifiedUsers => "segment_specified_users",
            AssetSlug::SegmentFollowers => "segment_followers",
            AssetSlug::SegmentFollowed => "segment_followed",
            AssetSlug::SegmentMutuals => "segment_mutuals",
            AssetSlug::SegmentUnreciprocatedFollowed => "segment_unreciprocated_followed",
            AssetSlug::PostCorpusForSegment => "post_corpus_for_segment",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParamsError> {
        match s {
            "segment_specified_users" => Ok(AssetSlug::SegmentSpecifiedUsers),
            "segment_followers" => Ok(AssetSlug::SegmentFollowers),
            "segment_followed" => Ok(AssetSlug::SegmentFollowed),
            "segment_mutuals" => Ok(AssetSlug::SegmentMutuals),
            "segment_unreciprocated_followed" => Ok(AssetSlug::SegmentUnreciprocatedFollowed),
            "post_corpus_for_segment" => Ok(AssetSlug::PostCorpusForSegment),
            other => Err(ParamsError::UnknownSlug(other.to_string())),
        }
    }
}

impl std::fmt::Display for AssetSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Every asset's parameters, keyed by the closed [`AssetSlug`] set.
///
/// `fanout_source_params_hash` is carried by every variant and contributes to
/// identity iff present — it scopes fanout-minted instances to the source
/// instance that produced them in `scoped_by_source` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "asset_slug", rename_all = "snake_case")]
pub enum AssetParams {
    SegmentSpecifiedUsers {
        stable_key: String,
        fanout_source_params_hash: Option<String>,
    },
    SegmentFollowers {
        subject_user_id: UserId,
        fanout_source_params_hash: Option<String>,
    },
    SegmentFollowed {
        subject_user_id: UserId,
        fanout_source_params_hash: Option<String>,
    },
    SegmentMutuals {
        subject_user_id: UserId,
        fanout_source_params_hash: Option<String>,
    },
    SegmentUnreciprocatedFollowed {
        subject_user_id: UserId,
        fanout_source_params_hash: Option<String>,
    },
    PostCorpusForSegment {
        source_segment_params: Box<AssetParams>,
        fanout_source_params_hash: Option<String>,
    },
}

impl AssetParams {
    pub fn slug(&self) -> AssetSlug {
        match self {
            AssetParams::SegmentSpecifiedUsers { .. } => AssetSlug::SegmentSpecifiedUsers,
            AssetParams::SegmentFollowers { .. } => AssetSlug::SegmentFollowers,
            AssetParams::SegmentFollowed { .. } => AssetSlug::SegmentFollowed,
            AssetParams::SegmentMutuals { .. } => AssetSlug::SegmentMutuals,
            AssetParams::SegmentUnreciprocatedFollowed { .. } => {
                AssetSlug::SegmentUnreciprocatedFollowed
            }
            AssetParams::PostCorpusForSegment { .. } => AssetSlug::PostCorpusForSegment,
        }
    }

    pub fn fanout_source_params_hash(&self) -> Option<&str> {
        match self {
            AssetParams::SegmentSpecifiedUsers {
                fanout_source_params_hash,
                ..
            }
            | AssetParams::SegmentFollowers {
                fanout_source_params_hash,
                ..
            }
            | AssetParams::SegmentFollowed {
                fanout_source_params_hash,
                ..
            }
            | AssetParams::SegmentMutuals {
                fanout_source_params_hash,
                ..
            }
            | AssetParams::SegmentUnreciprocatedFollowed {
                fanout_source_params_hash,
                ..
            }
            | AssetParams::PostCorpusForSegment {
                fanout_source_params_hash,
                ..
            } => fanout_source_params_hash.as_deref(),
        }
    }

    /// Returns `subject_user_id` for the four subject-scoped segment variants.
    pub fn subject_user_id(&self) -> Option<UserId> {
        match self {
            AssetParams::SegmentFollowers { subject_user_id, .. }
            | AssetParams::SegmentFollowed { subject_user_id, .. }
            | AssetParams::SegmentMutuals { subject_user_id, .. }
            | AssetParams::SegmentUnreciprocatedFollowed { subject_user_id, .. } => {
                Some(*subject_user_id)
            }
            _ => None,
        }
    }

    /// The versioned, hex-encoded identity hash for these params.
    pub fn params_hash_v1(&self) -> (String, i32) {
        let mut parts: Vec<String> = vec![
            "kind=params_hash:v1".to_string(),
            format!("asset_slug={}", self.slug()),
        ];

        match self {
            AssetParams::SegmentSpecifiedUsers { stable_key, .. } => {
                parts.push(format!("stable_key={stable_key}"));
            }
            AssetParams::SegmentFollowers { subject_user_id, .. }
            | AssetParams::SegmentFollowed { subject_user_id, .. }
            | AssetParams::SegmentMutuals { subject_user_id, .. }
            | AssetParams::SegmentUnreciprocatedFollowed { subject_user_id, .. } => {
                parts.push(format!("subject_external_id={}", subject_user_id.0));
            }
            AssetParams::PostCorpusForSegment {
                source_segment_params,
                ..
            } => {
                let (nested_hash, nested_version) = source_segment_params.params_hash_v1();
                parts.push(format!("source_segment_params_hash_version={nested_version}"));
                parts.push(format!("source_segment_params_hash={nested_hash}"));
            }
        }

        parts.push(format!(
            "fanout_source_params_hash={}",
            self.fanout_source_params_hash().unwrap_or("none")
        ));

        hash_parts_v1(parts)
    }

    /// Stable, human-readable rendering for logs and decision entries, e.g.
    /// `segment_followers[subject=42]`.
    pub fn format(&self) -> String {
        let inner = match self {
            AssetParams::SegmentSpecifiedUsers { stable_key, .. } => {
                format!("key={stable_key}")
            }
            AssetParams::SegmentFollowers { subject_user_id, .. }
            | AssetParams::SegmentFollowed { subject_user_id, .. }
            | AssetParams::SegmentMutuals { subject_user_id, .. }
            | AssetParams::SegmentUnreciprocatedFollowed { subject_user_id, .. } => {
                format!("subject={subject_user_id}")
            }
            AssetParams::PostCorpusForSegment {
                source_segment_params,
                ..
            } => format!("source={}", source_segment_params.format()),
        };
        if let Some(fanout_hash) = self.fanout_source_params_hash() {
            format!("{}[{inner}, fanout_from={fanout_hash}]", self.slug())
        } else {
            format!("{}[{inner}]", self.slug())
        }
    }
}

impl std::fmt::Display for AssetParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// Parse raw, slug-tagged JSON into a validated [`AssetParams`].
///
/// Boundary validation: user ids must be representable as `u64` (accepted
/// either as a JSON number or a canonical decimal string); the nested
/// `post_corpus_for_segment.source_segment_params` must itself parse as one
/// of the four segment variants (not another `post_corpus_for_segment`).
pub fn parse_asset_params(slug: AssetSlug, raw: &Value) -> Result<AssetParams, ParamsError> {
    let fanout_source_params_hash = raw
        .get("fanout_source_params_hash")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match slug {
        AssetSlug::SegmentSpecifiedUsers => {
            let stable_key = raw
                .get("stable_key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ParamsError::InvalidParams {
                    slug: slug.to_string(),
                    message: "missing stable_key".to_string(),
                })?
                .to_string();
            Ok(AssetParams::SegmentSpecifiedUsers {
                stable_key,
                fanout_source_params_hash,
            })
        }
        AssetSlug::SegmentFollowers
        | AssetSlug::SegmentFollowed
        | AssetSlug::SegmentMutuals
        | AssetSlug::SegmentUnreciprocatedFollowed => {
            let subject_user_id = parse_user_id(raw.get("subject_user_id"))?;
            Ok(match slug {
                AssetSlug::SegmentFollowers => AssetParams::SegmentFollowers {
                    subject_user_id,
                    fanout_source_params_hash,
                },
                AssetSlug::SegmentFollowed => AssetParams::SegmentFollowed {
                    subject_user_id,
                    fanout_source_params_hash,
                },
                AssetSlug::SegmentMutuals => AssetParams::SegmentMutuals {
                    subject_user_id,
                    fanout_source_params_hash,
                },
                AssetSlug::SegmentUnreciprocatedFollowed => {
                    AssetParams::SegmentUnreciprocatedFollowed {
                        subject_user_id,
                        fanout_source_params_hash,
                    }
                }
                _ => unreachable!(),
            })
        }
        AssetSlug::PostCorpusForSegment => {
            let nested_raw = raw.get("source_segment_params").ok_or_else(|| {
                ParamsError::InvalidParams {
                    slug: slug.to_string(),
                    message: "missing source_segment_params".to_string(),
                }
            })?;
            let nested_slug_str = nested_raw
                .get("asset_slug")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ParamsError::InvalidParams {
                    slug: slug.to_string(),
                    message: "source_segment_params missing asset_slug".to_string(),
                })?;
            let nested_slug = AssetSlug::parse(nested_slug_str)?;
            if nested_slug == AssetSlug::PostCorpusForSegment {
                return Err(ParamsError::InvalidParams {
                    slug: slug.to_string(),
                    message: "source_segment_params must be a segment variant".to_string(),
                });
            }
            let source_segment_params = parse_asset_params(nested_slug, nested_raw)?;
            Ok(AssetParams::PostCorpusForSegment {
                source_segment_params: Box::new(source_segment_params),
                fanout_source_params_hash,
            })
        }
    }
}

fn parse_user_id(raw: Option<&Value>) -> Result<UserId, ParamsError> {
    let raw = raw.ok_or_else(|| ParamsError::InvalidUserId("missing".to_string()))?;
    if let Some(n) = raw.as_u64() {
        return Ok(UserId(n));
    }
    if let Some(s) = raw.as_str() {
        return s
            .parse::<u64>()
            .map(UserId)
            .map_err(|_| ParamsError::InvalidUserId(s.to_string()));
    }
    Err(ParamsError::InvalidUserId(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_hash_is_stable_for_equal_content() {
        let a = AssetParams::SegmentFollowers {
            subject_user_id: UserId(42),
            fanout_source_params_hash: None,
        };
        let b = AssetParams::SegmentFollowers {
            subject_user_id: UserId(42),
            fanout_source_params_hash: None,
        };
        assert_eq!(a.params_hash_v1(), b.params_hash_v1());
    }

    #[test]
    fn params_hash_distinguishes_fanout_scope() {
        let unscoped = AssetParams::SegmentFollowers {
            subject_user_id: UserId(42),
            fanout_source_params_hash: None,
        };
        let scoped = AssetParams::SegmentFollowers {
            subject_user_id: UserId(42),
            fanout_source_params_hash: Some("deadbeef".to_string()),
        };
        assert_ne!(unscoped.params_hash_v1().0, scoped.params_hash_v1().0);
    }

    #[test]
    fn params_hash_distinguishes_slugs_with_same_subject() {
        let followers = AssetParams::SegmentFollowers {
            subject_user_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let followed = AssetParams::SegmentFollowed {
            subject_user_id: UserId(1),
            fanout_source_params_hash: None,
        };
        assert_ne!(followers.params_hash_v1().0, followed.params_hash_v1().0);
    }

    #[test]
    fn nested_post_corpus_hash_depends_on_source() {
        let src_a = AssetParams::SegmentFollowers {
            subject_user_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let src_b = AssetParams::SegmentFollowers {
            subject_user_id: UserId(2),
            fanout_source_params_hash: None,
        };
        let corpus_a = AssetParams::PostCorpusForSegment {
            source_segment_params: Box::new(src_a),
            fanout_source_params_hash: None,
        };
        let corpus_b = AssetParams::PostCorpusForSegment {
            source_segment_params: Box::new(src_b),
            fanout_source_params_hash: None,
        };
        assert_ne!(corpus_a.params_hash_v1().0, corpus_b.params_hash_v1().0);
    }

    #[test]
    fn format_renders_readable_string() {
        let p = AssetParams::SegmentFollowers {
            subject_user_id: UserId(42),
            fanout_source_params_hash: None,
        };
        assert_eq!(p.format(), "segment_followers[subject=42]");
    }

    #[test]
    fn parse_rejects_unknown_slug() {
        assert!(matches!(
            AssetSlug::parse("segment_unknown"),
            Err(ParamsError::UnknownSlug(_))
        ));
    }

    #[test]
    fn parse_accepts_decimal_string_user_id() {
        let raw = json!({"subject_user_id": "42"});
        let parsed = parse_asset_params(AssetSlug::SegmentFollowers, &raw).unwrap();
        assert_eq!(parsed.subject_user_id(), Some(UserId(42)));
    }

    #[test]
    fn parse_rejects_nested_post_corpus() {
        let raw = json!({
            "source_segment_params": {
                "asset_slug": "post_corpus_for_segment",
                "source_segment_params": {"asset_slug": "segment_followers", "subject_user_id": 1}
            }
        });
        let result = parse_asset_params(AssetSlug::PostCorpusForSegment, &raw);
        assert!(result.is_err());
    }
}
