//! # Asset Classifiers
//!
//! Funzioni pure che assegnano un punteggio agli elementi DOM e scelgono il
//! ramo della pipeline. Dipendono solo dal trait `DomElement`.
//!
//! ## Policy documentate:
//! - Video: in caso di pareggio o assenza di segnali → click-to-play
//! - Widget: il match con confidenza più alta vince, nessun match → nessuna facade

pub mod dom;
pub mod placement;
pub mod signals;
pub mod video;
pub mod widget;

pub use dom::DomElement;
pub use placement::{in_landmark, is_above_fold, is_critical, lcp_candidate, LcpCandidate, EAGER_IMAGE_COUNT};
pub use signals::{decide, VideoClassification, VideoKind, VideoSignal, VIDEO_SIGNAL_WEIGHTS};
pub use video::{classify_video, parse_embed, EmbedInfo, EmbedPlatform};
pub use widget::{classify_widget, detect_widgets, widget_by_name, WidgetCategory, WidgetClassification, WIDGET_REGISTRY};
