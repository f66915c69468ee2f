//! Trace levels per category, scoped by frames.
//!
//! A frame overrides levels for some categories; lookups fall through newer
//! frames to older ones and finally to the process-wide defaults. A message is
//! emitted when its category's level is above [`LogLevel::NONE`] and no higher
//! than the configured threshold.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::TraceConfig;
use crate::outcome::Severity;
use crate::persist::{expect_start, required_attribute, PersistError, PersistResult, Persistent};
use crate::xml::{XmlPullSource, XmlResult, XmlWriter};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogLevel(pub u32);

impl LogLevel {
    pub const NONE: LogLevel = LogLevel(0);
    pub const MIN: LogLevel = LogLevel(1);
    pub const NORMAL: LogLevel = LogLevel(5);
    pub const MAX: LogLevel = LogLevel(10);
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    /// Accepts a number or one of `none`, `min`, `normal`, `max`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(LogLevel::NONE),
            "min" => Ok(LogLevel::MIN),
            "normal" => Ok(LogLevel::NORMAL),
            "max" => Ok(LogLevel::MAX),
            other => other
                .parse::<u32>()
                .map(LogLevel)
                .map_err(|_| format!("invalid log level '{}'", s)),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TraceCategory {
    Disaster,
    AuditError,
    InternalError,
    OperatorError,
    UserError,
    InternalWarning,
    OperatorWarning,
    UserWarning,
    DeveloperProgress,
    OperatorProgress,
    UserProgress,
    DeveloperInfo,
    OperatorInfo,
    UserInfo,
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Audience {
    Developer,
    Operator,
    User,
    Audit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CategoryGroup {
    Error,
    Warning,
    Progress,
    Info,
}

impl TraceCategory {
    pub fn severity(self) -> Severity {
        if self == TraceCategory::Disaster {
            return Severity::Fatal;
        }
        match self.group() {
            CategoryGroup::Error => Severity::Error,
            CategoryGroup::Warning => Severity::Warning,
            CategoryGroup::Progress => Severity::Progress,
            CategoryGroup::Info => Severity::Info,
        }
    }

    pub fn group(self) -> CategoryGroup {
        use TraceCategory::*;
        match self {
            Disaster | AuditError | InternalError | OperatorError | UserError => {
                CategoryGroup::Error
            }
            InternalWarning | OperatorWarning | UserWarning => CategoryGroup::Warning,
            DeveloperProgress | OperatorProgress | UserProgress => CategoryGroup::Progress,
            DeveloperInfo | OperatorInfo | UserInfo | Stats => CategoryGroup::Info,
        }
    }

    pub fn audience(self) -> Audience {
        use TraceCategory::*;
        match self {
            AuditError => Audience::Audit,
            InternalError | InternalWarning | DeveloperProgress | DeveloperInfo => {
                Audience::Developer
            }
            Disaster | OperatorError | OperatorWarning | OperatorProgress | OperatorInfo
            | Stats => Audience::Operator,
            UserError | UserWarning | UserProgress | UserInfo => Audience::User,
        }
    }

    pub fn default_level(self) -> LogLevel {
        use TraceCategory::*;
        match self {
            Disaster | AuditError | OperatorError | OperatorWarning | OperatorProgress
            | OperatorInfo | Stats => LogLevel::MIN,
            _ => LogLevel::NONE,
        }
    }

    fn all() -> impl Iterator<Item = TraceCategory> {
        <TraceCategory as strum::IntoEnumIterator>::iter()
    }
}

/// Process-wide levels shared by every trace state.
#[derive(Debug, Clone)]
pub struct TraceDefaults {
    levels: HashMap<TraceCategory, LogLevel>,
    threshold: LogLevel,
}

impl Default for TraceDefaults {
    fn default() -> Self {
        Self::from_config(&TraceConfig::default())
    }
}

impl TraceDefaults {
    pub fn from_config(config: &TraceConfig) -> Self {
        let mut levels: HashMap<TraceCategory, LogLevel> = TraceCategory::all()
            .map(|category| (category, category.default_level()))
            .collect();
        levels.extend(config.levels.iter().map(|(c, l)| (*c, *l)));
        Self {
            levels,
            threshold: config.threshold,
        }
    }

    pub fn level(&self, category: TraceCategory) -> LogLevel {
        self.levels
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_level())
    }

    pub fn threshold(&self) -> LogLevel {
        self.threshold
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceError {
    #[error("the base trace frame cannot be popped")]
    BaseFrame,
    #[error("trace frame {0} does not exist")]
    InvalidFrame(usize),
}

type TraceFrame = HashMap<TraceCategory, LogLevel>;

#[derive(Debug, Clone)]
pub struct TraceState {
    defaults: Arc<TraceDefaults>,
    frames: Vec<TraceFrame>,
}

impl Default for TraceState {
    fn default() -> Self {
        Self::new(Arc::new(TraceDefaults::default()))
    }
}

impl TraceState {
    /// Starts with a single base frame that carries no overrides.
    pub fn new(defaults: Arc<TraceDefaults>) -> Self {
        Self {
            defaults,
            frames: vec![TraceFrame::new()],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_frame(&mut self) -> usize {
        self.frames.push(TraceFrame::new());
        self.frames.len() - 1
    }

    pub fn pop_frame(&mut self) -> Result<(), TraceError> {
        if self.frames.len() <= 1 {
            return Err(TraceError::BaseFrame);
        }
        self.frames.pop();
        Ok(())
    }

    pub fn log_level(&self, category: TraceCategory) -> LogLevel {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(&category).copied())
            .unwrap_or_else(|| self.defaults.level(category))
    }

    fn frame_mut(&mut self, frame: Option<usize>) -> Result<&mut TraceFrame, TraceError> {
        let index = frame.unwrap_or(self.frames.len() - 1);
        self.frames
            .get_mut(index)
            .ok_or(TraceError::InvalidFrame(index))
    }

    /// Overrides a level in `frame`, or in the newest frame when `None`.
    pub fn set_log_level(
        &mut self,
        category: TraceCategory,
        level: LogLevel,
        frame: Option<usize>,
    ) -> Result<(), TraceError> {
        self.frame_mut(frame)?.insert(category, level);
        Ok(())
    }

    pub fn set_audience_level(&mut self, audience: Audience, level: LogLevel) {
        if let Some(frame) = self.frames.last_mut() {
            for category in TraceCategory::all().filter(|c| c.audience() == audience) {
                frame.insert(category, level);
            }
        }
    }

    pub fn set_group_level(&mut self, group: CategoryGroup, level: LogLevel) {
        if let Some(frame) = self.frames.last_mut() {
            for category in TraceCategory::all().filter(|c| c.group() == group) {
                frame.insert(category, level);
            }
        }
    }

    /// Drops the newest frame's override so older frames show through.
    pub fn reset_log_level(&mut self, category: TraceCategory) {
        if let Some(frame) = self.frames.last_mut() {
            frame.remove(&category);
        }
    }

    pub fn is_enabled(&self, category: TraceCategory) -> bool {
        let level = self.log_level(category);
        level > LogLevel::NONE && level <= self.defaults.threshold()
    }

    /// Writes a message through `tracing` if the category is enabled.
    pub fn emit(&self, category: TraceCategory, code: u32, message: &str) -> bool {
        if !self.is_enabled(category) {
            return false;
        }
        match category.severity() {
            Severity::Fatal | Severity::Error => error!(%category, code, "{}", message),
            Severity::Warning => warn!(%category, code, "{}", message),
            Severity::Info => info!(%category, code, "{}", message),
            _ => debug!(%category, code, "{}", message),
        }
        true
    }
}

impl Persistent for TraceState {
    const ELEMENT: &'static str = "TraceState";

    fn persist(&self, writer: &mut XmlWriter) -> XmlResult<()> {
        let frames = self.frames.len().to_string();
        writer.start(Self::ELEMENT, &[("frames", &frames)])?;
        for (index, frame) in self.frames.iter().enumerate() {
            let index = index.to_string();
            writer.start("Frame", &[("index", &index)])?;
            let mut entries: Vec<_> = frame.iter().collect();
            entries.sort();
            for (category, level) in entries {
                let id = category.to_string();
                let level = level.0.to_string();
                writer.empty("Category", &[("id", &id), ("level", &level)])?;
            }
            writer.end("Frame")?;
        }
        writer.end(Self::ELEMENT)
    }

    fn restore(&mut self, source: &mut dyn XmlPullSource) -> PersistResult<()> {
        expect_start(source, Self::ELEMENT)?;
        let declared = source
            .current_attribute("frames")
            .unwrap_or_default()
            .to_string();
        let count = declared
            .parse::<usize>()
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| PersistError::InvalidFrameCount(declared.clone()))?;

        let mut frames: Vec<Option<TraceFrame>> = vec![None; count];
        while source.next() {
            if source.at_end_tag(Some(Self::ELEMENT)) {
                break;
            }
            if !source.at_start_tag(Some("Frame")) {
                if source.at_start_tag(None) {
                    source.skip();
                }
                continue;
            }
            let index_text = source.current_attribute("index").unwrap_or_default().to_string();
            let index = index_text
                .parse::<usize>()
                .ok()
                .filter(|i| *i < count)
                .ok_or_else(|| PersistError::InvalidFrameIndex(index_text.clone()))?;
            if frames[index].is_some() {
                return Err(PersistError::DuplicateFrame(index));
            }
            let mut frame = TraceFrame::new();
            while source.next() {
                if source.at_end_tag(Some("Frame")) {
                    break;
                }
                if !source.at_start_tag(None) {
                    continue;
                }
                let id = required_attribute(source, "Category", "id");
                let level = required_attribute(source, "Category", "level")
                    .and_then(|l| l.parse::<u32>().ok());
                match (id.as_deref().map(str::parse::<TraceCategory>), level) {
                    (Some(Ok(category)), Some(level)) => {
                        frame.insert(category, LogLevel(level));
                    }
                    _ => warn!("skipping unreadable trace category {:?}", id),
                }
                source.skip();
            }
            frames[index] = Some(frame);
        }

        let mut restored = Vec::with_capacity(count);
        for (index, frame) in frames.into_iter().enumerate() {
            restored.push(frame.ok_or_else(|| PersistError::InvalidFrameIndex(index.to_string()))?);
        }
        self.frames = restored;
        Ok(())
    }
}
