//! Shared domain model for the refinery pipeline.
//!
//! Holds the capture, extraction, cluster, card, and run shapes together with
//! their validation rules, the tier gate applied at the read boundary, the
//! environment-driven application config, and the repository traits that the
//! storage backends implement.

/// Implements `as_str`, `Display`, and `FromStr` for a fieldless enum stored
/// as text.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::validate::ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::validate::ValidationError::new(
                        stringify!($ty),
                        format!("unknown value '{other}'"),
                    )),
                }
            }
        }
    };
}

pub mod alpha;
pub mod app_config;
pub mod capture;
pub mod config;
pub mod gate;
pub mod refinery;
pub mod run;
pub mod store;
pub mod validate;

pub use alpha::{
    AlphaCard, AlphaCategory, AlphaDraft, Blueprint, CardStatus, EvidenceQuote, MvpWeek,
    ALPHA_CARD_TTL_HOURS,
};
pub use app_config::{AppConfig, Environment, StoreBackend};
pub use capture::{
    CaptureMetadata, CaptureRecord, CaptureStatus, PostRecord, RawCapture, MAX_POSTS_PER_CAPTURE,
    MAX_POST_CONTENT_CHARS,
};
pub use config::{load_app_config, load_app_config_from_env, ConfigError};
pub use gate::{gate_alpha_card, AccessTier, PRO_FIELDS};
pub use refinery::{
    cluster_identity_key, Direction, EntityCategory, FrictionPoint, NotableMention,
    PatternCluster, Sentiment, Severity, ScrubberOutput, TechEntity,
};
pub use run::{MatcherStats, PipelineRun, RunStatus, ScrubberStats, StrategistStats};
pub use store::{
    AlphaCardRepo, CardQuery, CaptureInsert, CaptureRepo, ClusterRepo, NonceLedger,
    PipelineRunRepo, ProcessedPostLedger, RefineryStore, ScrubberOutputRepo, StoreError,
};
pub use validate::{Validate, ValidationError};
