//! # Signal Weights
//!
//! Tabella esplicita dei pesi usati dal classificatore video. Le soglie sono
//! testabili senza passare dal parsing DOM: `decide()` lavora solo su segnali.
//!
//! ## Policy di default:
//! - vince il ramo con punteggio **strettamente** maggiore
//! - pareggio o nessun segnale → click-to-play (mai autoplay silenzioso)

use serde::Serialize;

/// Branch a video element is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoKind {
    Background,
    ClickToPlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSignal {
    /// `data-background-video`, `data-bg-video`, `data-video-background`
    BackgroundDataAttribute,
    BackgroundClassName,
    PlayerClassName,
    FullBleedPositioning,
    CoverObjectFit,
    /// autoplay + muted + loop, no controls
    AutoplayMutedLoop,
    ControlsAttribute,
    PosterAttribute,
    NegativeZIndex,
    LayeredSibling,
    PageBuilderBackground,
    /// Vimeo `background=1`
    EmbedBackgroundParam,
    EmbedAutoplayMutedLoop,
    EmbedControlsHidden,
    /// Plain YouTube/Vimeo embed without autoplay parameters
    PlainEmbed,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalWeight {
    pub signal: VideoSignal,
    pub kind: VideoKind,
    pub weight: u32,
}

pub const VIDEO_SIGNAL_WEIGHTS: &[SignalWeight] = &[
    SignalWeight { signal: VideoSignal::BackgroundDataAttribute, kind: VideoKind::Background, weight: 50 },
    SignalWeight { signal: VideoSignal::BackgroundClassName, kind: VideoKind::Background, weight: 30 },
    SignalWeight { signal: VideoSignal::PlayerClassName, kind: VideoKind::ClickToPlay, weight: 30 },
    SignalWeight { signal: VideoSignal::FullBleedPositioning, kind: VideoKind::Background, weight: 20 },
    SignalWeight { signal: VideoSignal::CoverObjectFit, kind: VideoKind::Background, weight: 15 },
    SignalWeight { signal: VideoSignal::AutoplayMutedLoop, kind: VideoKind::Background, weight: 45 },
    SignalWeight { signal: VideoSignal::ControlsAttribute, kind: VideoKind::ClickToPlay, weight: 40 },
    SignalWeight { signal: VideoSignal::PosterAttribute, kind: VideoKind::ClickToPlay, weight: 10 },
    SignalWeight { signal: VideoSignal::NegativeZIndex, kind: VideoKind::Background, weight: 20 },
    SignalWeight { signal: VideoSignal::LayeredSibling, kind: VideoKind::Background, weight: 15 },
    SignalWeight { signal: VideoSignal::PageBuilderBackground, kind: VideoKind::Background, weight: 40 },
    SignalWeight { signal: VideoSignal::EmbedBackgroundParam, kind: VideoKind::Background, weight: 45 },
    SignalWeight { signal: VideoSignal::EmbedAutoplayMutedLoop, kind: VideoKind::Background, weight: 35 },
    SignalWeight { signal: VideoSignal::EmbedControlsHidden, kind: VideoKind::Background, weight: 10 },
    SignalWeight { signal: VideoSignal::PlainEmbed, kind: VideoKind::ClickToPlay, weight: 20 },
];

pub fn weight_of(signal: VideoSignal) -> SignalWeight {
    VIDEO_SIGNAL_WEIGHTS
        .iter()
        .copied()
        .find(|w| w.signal == signal)
        .unwrap_or(SignalWeight { signal, kind: VideoKind::ClickToPlay, weight: 0 })
}

/// Outcome of scoring a signal list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoClassification {
    pub kind: VideoKind,
    pub confidence: f32,
    pub signals: Vec<VideoSignal>,
    pub background_score: u32,
    pub click_score: u32,
}

/// Score `signals` (each counted once) and pick a branch
pub fn decide(mut signals: Vec<VideoSignal>) -> VideoClassification {
    let mut seen = std::collections::HashSet::new();
    signals.retain(|s| seen.insert(*s));

    let (mut background_score, mut click_score) = (0u32, 0u32);
    for signal in &signals {
        let weight = weight_of(*signal);
        match weight.kind {
            VideoKind::Background => background_score += weight.weight,
            VideoKind::ClickToPlay => click_score += weight.weight,
        }
    }

    let kind = if background_score > click_score {
        VideoKind::Background
    } else {
        VideoKind::ClickToPlay
    };

    let total = background_score + click_score;
    let confidence = if total == 0 {
        0.0
    } else {
        background_score.max(click_score) as f32 / total as f32
    };

    VideoClassification {
        kind,
        confidence,
        signals,
        background_score,
        click_score,
    }
}
