//! Topic routing.
//!
//! An ordered list of matchers turns a topic string into a [`Route`]; the
//! pipeline dispatches on the variant and never inspects the string again.

use crate::db::models::CameraKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtlsKind {
    Status,
    Beacon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraTopicKind {
    Status,
    Info,
    Event { analytic: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Rtls {
        /// Raw topic segment, normalised by the parser
        gateway: String,
        kind: RtlsKind,
    },
    Camera {
        key: CameraKey,
        kind: CameraTopicKind,
    },
    CollectorStatus {
        tenant: String,
        building: String,
    },
    /// Prefix matched but the shape did not
    Malformed { reason: String },
    /// No matcher claimed the topic
    Unrecognized,
}

impl Route {
    /// Key that keeps every message for one device on the same worker
    pub fn partition_key(&self) -> Option<String> {
        match self {
            Self::Rtls { gateway, .. } => Some(gateway.to_ascii_uppercase()),
            Self::Camera { key, .. } => Some(key.to_string()),
            Self::CollectorStatus { tenant, building } => Some(format!("{}/{}", tenant, building)),
            Self::Malformed { .. } | Self::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Rtls { base: Vec<String> },
    Camera { base: Vec<String> },
}

impl Matcher {
    fn base(&self) -> &[String] {
        match self {
            Self::Rtls { base } | Self::Camera { base } => base,
        }
    }

    /// None when the base prefix does not match
    fn try_match(&self, segments: &[&str]) -> Option<Route> {
        let base = self.base();
        if segments.len() < base.len() || !base.iter().zip(segments).all(|(b, s)| b == s) {
            return None;
        }
        let rest = &segments[base.len()..];
        if rest.iter().any(|s| s.is_empty()) {
            return Some(Route::Malformed {
                reason: "empty topic segment".to_string(),
            });
        }

        Some(match self {
            Self::Rtls { .. } => match rest {
                [gateway, "status"] => Route::Rtls {
                    gateway: gateway.to_string(),
                    kind: RtlsKind::Status,
                },
                [gateway, "beacon"] => Route::Rtls {
                    gateway: gateway.to_string(),
                    kind: RtlsKind::Beacon,
                },
                _ => Route::Malformed {
                    reason: format!("expected <gateway>/status|beacon, got {} segments", rest.len()),
                },
            },
            Self::Camera { .. } => match rest {
                [tenant, building, "collector", "status"] => Route::CollectorStatus {
                    tenant: tenant.to_string(),
                    building: building.to_string(),
                },
                [tenant, building, floor, "camera", code, "status"] => Route::Camera {
                    key: camera_key(tenant, building, floor, code),
                    kind: CameraTopicKind::Status,
                },
                [tenant, building, floor, "camera", code, "info"] => Route::Camera {
                    key: camera_key(tenant, building, floor, code),
                    kind: CameraTopicKind::Info,
                },
                [tenant, building, floor, "camera", code, analytic, "events"] => Route::Camera {
                    key: camera_key(tenant, building, floor, code),
                    kind: CameraTopicKind::Event {
                        analytic: analytic.to_string(),
                    },
                },
                _ => Route::Malformed {
                    reason: format!("unexpected camera topic shape ({} segments)", rest.len()),
                },
            },
        })
    }
}

fn camera_key(tenant: &str, building: &str, floor: &str, code: &str) -> CameraKey {
    CameraKey {
        tenant: tenant.to_string(),
        building: building.to_string(),
        floor: floor.to_string(),
        code: code.to_string(),
    }
}

fn split_base(base: &str) -> Vec<String> {
    base.trim_matches('/')
        .split('/')
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    matchers: Vec<Matcher>,
}

impl TopicRouter {
    pub fn new(rtls_base: &str, camera_base: &str) -> Self {
        let mut matchers = vec![
            Matcher::Rtls { base: split_base(rtls_base) },
            Matcher::Camera { base: split_base(camera_base) },
        ];
        // most specific prefix first
        matchers.sort_by(|a, b| b.base().len().cmp(&a.base().len()));
        Self { matchers }
    }

    pub fn route(&self, topic: &str) -> Route {
        let segments: Vec<&str> = topic.split('/').collect();
        self.matchers
            .iter()
            .find_map(|m| m.try_match(&segments))
            .unwrap_or(Route::Unrecognized)
    }

    /// Broker subscription filters, one per topic family
    pub fn filters(&self) -> Vec<String> {
        self.matchers
            .iter()
            .map(|m| format!("{}/#", m.base().join("/")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TopicRouter {
        TopicRouter::new("rtls/gateways", "rtls/cameras")
    }

    #[test]
    fn rtls_topics() {
        assert_eq!(
            router().route("rtls/gateways/AABBCCDDEEFF/beacon"),
            Route::Rtls {
                gateway: "AABBCCDDEEFF".to_string(),
                kind: RtlsKind::Beacon
            }
        );
        assert!(matches!(
            router().route("rtls/gateways/AABBCCDDEEFF/status"),
            Route::Rtls { kind: RtlsKind::Status, .. }
        ));
    }

    #[test]
    fn camera_topics() {
        let route = router().route("rtls/cameras/acme/hq/f2/camera/cam-7/faceCapture/events");
        match route {
            Route::Camera { key, kind } => {
                assert_eq!(key.to_string(), "acme/hq/f2/cam-7");
                assert_eq!(kind, CameraTopicKind::Event { analytic: "faceCapture".to_string() });
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert!(matches!(
            router().route("rtls/cameras/acme/hq/f2/camera/cam-7/info"),
            Route::Camera { kind: CameraTopicKind::Info, .. }
        ));
        assert_eq!(
            router().route("rtls/cameras/acme/hq/collector/status"),
            Route::CollectorStatus {
                tenant: "acme".to_string(),
                building: "hq".to_string()
            }
        );
    }

    #[test]
    fn wrong_segment_counts_are_malformed() {
        for topic in [
            "rtls/gateways/AABBCCDDEEFF",
            "rtls/gateways/AABBCCDDEEFF/beacon/extra",
            "rtls/gateways/AABBCCDDEEFF/unknown",
            "rtls/cameras/acme/hq/f2/camera/cam-7",
            "rtls/cameras/acme/hq/f2/cam/cam-7/status",
            "rtls/cameras/acme/hq/f2/camera/cam-7/faceCapture/events/x",
            "rtls/gateways//beacon",
        ] {
            assert!(matches!(router().route(topic), Route::Malformed { .. }), "{}", topic);
        }
    }

    #[test]
    fn foreign_topics_are_unrecognized() {
        assert_eq!(router().route("other/thing"), Route::Unrecognized);
        assert_eq!(router().route("rtls"), Route::Unrecognized);
        assert_eq!(router().route(""), Route::Unrecognized);
    }

    #[test]
    fn nested_bases_prefer_longest() {
        let router = TopicRouter::new("site", "site/cameras");
        assert!(matches!(
            router.route("site/cameras/t/b/f/camera/c/status"),
            Route::Camera { .. }
        ));
        assert!(matches!(router.route("site/AABBCCDDEEFF/beacon"), Route::Rtls { .. }));
    }

    #[test]
    fn filters_cover_both_families() {
        let mut filters = router().filters();
        filters.sort();
        assert_eq!(filters, vec!["rtls/cameras/#", "rtls/gateways/#"]);
    }
}
