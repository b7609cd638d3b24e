//! Ordine fisso degli stage di ottimizzazione.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Css,
    Js,
    Fonts,
    Images,
    VideoFacades,
    WidgetFacades,
    Seo,
    ResourceHints,
    Migration,
    Finalize,
}

impl Stage {
    pub const ORDER: [Stage; 10] = [
        Stage::Css,
        Stage::Js,
        Stage::Fonts,
        Stage::Images,
        Stage::VideoFacades,
        Stage::WidgetFacades,
        Stage::Seo,
        Stage::ResourceHints,
        Stage::Migration,
        Stage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Css => "css",
            Self::Js => "js",
            Self::Fonts => "fonts",
            Self::Images => "images",
            Self::VideoFacades => "video_facades",
            Self::WidgetFacades => "widget_facades",
            Self::Seo => "seo",
            Self::ResourceHints => "resource_hints",
            Self::Migration => "migration",
            Self::Finalize => "finalize",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        let index = Self::ORDER.iter().position(|s| s == self)?;
        Self::ORDER.get(index + 1).copied()
    }

    /// Stages still to run after `last_completed`
    pub fn remaining_after(last_completed: Option<Stage>) -> impl Iterator<Item = Stage> {
        Self::ORDER
            .into_iter()
            .filter(move |stage| last_completed.map_or(true, |done| *stage > done))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
