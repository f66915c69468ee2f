//! Outcome ledger.
//!
//! Every diagnostic raised while loading or processing scripts lands here as
//! an [`Outcome`]. The ledger keeps the cumulative severity and turns it into
//! an overall [`OutcomeState`], honouring the warning-as-failure policy.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::persist::{expect_start, required_attribute, PersistResult, Persistent};
use crate::xml::{XmlPullSource, XmlResult, XmlWriter};

/// Outcome codes used by the engine itself.
pub mod codes {
    pub const REGISTRY: u32 = 100;
    pub const STRUCTURE: u32 = 200;
    pub const ATTRIBUTE: u32 = 201;
    pub const EXPRESSION: u32 = 202;
    pub const DUPLICATE: u32 = 203;
    pub const INPUT: u32 = 204;
    pub const PHASE_CONSTRAINT: u32 = 205;
    pub const ABORTED: u32 = 300;
    pub const FAILED: u32 = 301;
    pub const ABNORMAL: u32 = 302;
    pub const LOG_FILTER: u32 = 303;
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
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    #[default]
    Undefined,
    Progress,
    Info,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutcomeState {
    Success,
    Warned,
    Failed,
}

/// Coarse result of an operation such as a registration or a load.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum OutcomeType {
    #[default]
    Success,
    Warning,
    Error,
}

impl OutcomeType {
    pub fn worst(self, other: OutcomeType) -> OutcomeType {
        self.max(other)
    }
}

impl From<Severity> for OutcomeType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Fatal | Severity::Error => OutcomeType::Error,
            Severity::Warning => OutcomeType::Warning,
            _ => OutcomeType::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub severity: Severity,
    pub code: u32,
    pub message: String,
    pub component: Option<String>,
    pub operation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}|{}]",
            self.component.as_deref().unwrap_or("-"),
            self.operation.as_deref().unwrap_or("-"),
            self.severity,
            self.code,
            self.message
        )
    }
}

/// Saved component/operation pair, handed back by [`Outcomes::set_context`].
#[derive(Debug, Clone, Default)]
pub struct OutcomeContext {
    component: Option<String>,
    operation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Outcomes {
    severity: Severity,
    events: Vec<Outcome>,
    warning_as_failure: bool,
    context: OutcomeContext,
}

impl Outcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warning_as_failure(warning_as_failure: bool) -> Self {
        Self {
            warning_as_failure,
            ..Self::default()
        }
    }

    pub fn warning_as_failure(&self) -> bool {
        self.warning_as_failure
    }

    pub fn set_warning_as_failure(&mut self, warning_as_failure: bool) {
        self.warning_as_failure = warning_as_failure;
    }

    /// Sets the component and operation attached to subsequent records and
    /// returns the pair that was active before.
    pub fn set_context(&mut self, component: &str, operation: &str) -> OutcomeContext {
        std::mem::replace(
            &mut self.context,
            OutcomeContext {
                component: Some(component.to_string()),
                operation: Some(operation.to_string()),
            },
        )
    }

    pub fn restore_context(&mut self, saved: OutcomeContext) {
        self.context = saved;
    }

    fn raise(&mut self, severity: Severity) {
        match severity {
            Severity::Undefined => {}
            Severity::Progress | Severity::Info => {
                if self.severity < Severity::Info {
                    self.severity = Severity::Info;
                }
            }
            _ => self.severity = self.severity.max(severity),
        }
    }

    /// Stores an outcome without logging it.
    pub fn record_silent(&mut self, severity: Severity, code: u32, message: impl Into<String>) {
        if severity == Severity::Undefined {
            return;
        }
        self.raise(severity);
        self.events.push(Outcome {
            severity,
            code,
            message: message.into(),
            component: self.context.component.clone(),
            operation: self.context.operation.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Stores an outcome and logs it at the matching level.
    pub fn record(&mut self, severity: Severity, code: u32, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Undefined => return,
            Severity::Fatal | Severity::Error => error!(code, "{}", message),
            Severity::Warning => warn!(code, "{}", message),
            Severity::Info => info!(code, "{}", message),
            Severity::Progress => debug!(code, "{}", message),
        }
        self.record_silent(severity, code, message);
    }

    pub fn progress(&mut self, code: u32, message: impl Into<String>) {
        self.record(Severity::Progress, code, message)
    }

    pub fn info(&mut self, code: u32, message: impl Into<String>) {
        self.record(Severity::Info, code, message)
    }

    pub fn warning(&mut self, code: u32, message: impl Into<String>) {
        self.record(Severity::Warning, code, message)
    }

    pub fn error(&mut self, code: u32, message: impl Into<String>) {
        self.record(Severity::Error, code, message)
    }

    pub fn fatal(&mut self, code: u32, message: impl Into<String>) {
        self.record(Severity::Fatal, code, message)
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn state(&self) -> OutcomeState {
        match self.severity {
            Severity::Fatal | Severity::Error => OutcomeState::Failed,
            Severity::Warning if self.warning_as_failure => OutcomeState::Failed,
            Severity::Warning => OutcomeState::Warned,
            _ => OutcomeState::Success,
        }
    }

    pub fn outcome_type(&self) -> OutcomeType {
        match self.state() {
            OutcomeState::Failed => OutcomeType::Error,
            OutcomeState::Warned => OutcomeType::Warning,
            OutcomeState::Success => OutcomeType::Success,
        }
    }

    pub fn is_error(&self) -> bool {
        self.state() == OutcomeState::Failed
    }

    pub fn events(&self) -> &[Outcome] {
        &self.events
    }

    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.events.iter().filter(|e| e.severity >= severity).count()
    }

    pub fn error_count(&self) -> usize {
        self.count_at_least(Severity::Error)
    }

    pub fn last(&self) -> Option<&Outcome> {
        self.events.last()
    }

    /// Worst severity recorded since `mark` events were present.
    pub fn severity_since(&self, mark: usize) -> Severity {
        self.events
            .iter()
            .skip(mark)
            .map(|e| e.severity)
            .max()
            .unwrap_or_default()
    }

    /// Outcome of the work recorded after `mark`, under the ledger's policy.
    pub fn outcome_since(&self, mark: usize) -> OutcomeType {
        match self.severity_since(mark) {
            Severity::Fatal | Severity::Error => OutcomeType::Error,
            Severity::Warning if self.warning_as_failure => OutcomeType::Error,
            Severity::Warning => OutcomeType::Warning,
            _ => OutcomeType::Success,
        }
    }

    pub fn mark(&self) -> usize {
        self.events.len()
    }

    pub fn reset(&mut self, severity: Severity, events: Vec<Outcome>) {
        self.severity = severity;
        self.events = events;
    }

    pub fn clear(&mut self) {
        self.reset(Severity::Undefined, Vec::new());
    }
}

const HISTORY_EVENT: &str = "Event";

impl Persistent for Outcomes {
    const ELEMENT: &'static str = "History";

    fn persist(&self, writer: &mut XmlWriter) -> XmlResult<()> {
        let count = self.events.len().to_string();
        let severity = self.severity.to_string();
        let policy = if self.warning_as_failure { "1" } else { "0" };
        writer.start(
            Self::ELEMENT,
            &[
                ("events", &count),
                ("severity", &severity),
                ("warningAsFailure", policy),
            ],
        )?;
        for event in &self.events {
            let severity = event.severity.to_string();
            let code = event.code.to_string();
            let timestamp = event.timestamp.to_rfc3339();
            let mut attributes = vec![
                ("type", severity.as_str()),
                ("code", code.as_str()),
                ("message", event.message.as_str()),
                ("timestamp", timestamp.as_str()),
            ];
            if let Some(component) = &event.component {
                attributes.push(("component", component.as_str()));
            }
            if let Some(operation) = &event.operation {
                attributes.push(("operation", operation.as_str()));
            }
            writer.empty(HISTORY_EVENT, &attributes)?;
        }
        writer.end(Self::ELEMENT)
    }

    fn restore(&mut self, source: &mut dyn XmlPullSource) -> PersistResult<()> {
        expect_start(source, Self::ELEMENT)?;
        let declared = source
            .current_attribute("severity")
            .and_then(|s| s.parse::<Severity>().ok());
        if let Some(policy) = source.current_attribute("warningAsFailure") {
            self.warning_as_failure = policy == "1";
        }

        let mut restored = Outcomes::with_warning_as_failure(self.warning_as_failure);
        while source.next() {
            if source.at_end_tag(Some(Self::ELEMENT)) {
                break;
            }
            if !source.at_start_tag(None) {
                continue;
            }
            if source.at_start_tag(Some(HISTORY_EVENT)) {
                let severity = required_attribute(source, HISTORY_EVENT, "type")
                    .and_then(|s| s.parse::<Severity>().ok());
                let code = required_attribute(source, HISTORY_EVENT, "code")
                    .and_then(|c| c.parse::<u32>().ok());
                let message = required_attribute(source, HISTORY_EVENT, "message");
                match (severity, code, message) {
                    (Some(severity), Some(code), Some(message)) => {
                        restored.raise(severity);
                        restored.events.push(Outcome {
                            severity,
                            code,
                            message,
                            component: source.current_attribute("component").map(str::to_string),
                            operation: source.current_attribute("operation").map(str::to_string),
                            timestamp: source
                                .current_attribute("timestamp")
                                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                                .map(|t| t.with_timezone(&Utc))
                                .unwrap_or_else(Utc::now),
                        });
                    }
                    _ => warn!("skipping unreadable history event"),
                }
            }
            source.skip();
        }

        let severity = declared.unwrap_or(restored.severity);
        self.reset(severity, restored.events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_progress_never_exceeds_info() {
        let mut outcomes = Outcomes::new();
        outcomes.record(Severity::Undefined, 0, "ignored");
        assert_eq!(outcomes.severity(), Severity::Undefined);
        assert!(outcomes.events().is_empty());

        outcomes.progress(1, "step");
        assert_eq!(outcomes.severity(), Severity::Info);
        outcomes.warning(2, "careful");
        outcomes.progress(3, "step");
        assert_eq!(outcomes.severity(), Severity::Warning);
        assert_eq!(outcomes.state(), OutcomeState::Warned);
        outcomes.error(4, "broken");
        outcomes.warning(5, "late");
        assert_eq!(outcomes.severity(), Severity::Error);
        assert_eq!(outcomes.state(), OutcomeState::Failed);
        assert_eq!(outcomes.error_count(), 1);
    }

    #[test]
    fn test_warning_as_failure() {
        let mut outcomes = Outcomes::with_warning_as_failure(true);
        outcomes.warning(1, "w");
        assert_eq!(outcomes.state(), OutcomeState::Failed);
        assert_eq!(outcomes.outcome_type(), OutcomeType::Error);
    }

    #[test]
    fn test_context_is_attached_and_restored() {
        let mut outcomes = Outcomes::new();
        let saved = outcomes.set_context("factory", "create");
        outcomes.warning(7, "not a statement");
        outcomes.restore_context(saved);
        outcomes.info(8, "plain");
        assert_eq!(
            outcomes.events()[0].to_string(),
            "factory create warning [7|not a statement]"
        );
        assert_eq!(outcomes.events()[1].component, None);
    }

    #[test]
    fn test_history_round_trip() {
        let mut outcomes = Outcomes::new();
        outcomes.set_context("phase", "process");
        outcomes.info(1, "started");
        outcomes.warning(2, "a \"quoted\" <note>");
        let xml = outcomes.to_xml().unwrap();

        let mut restored = Outcomes::new();
        restored.restore_xml(&xml).unwrap();
        assert_eq!(restored.severity(), Severity::Warning);
        assert_eq!(restored.events(), outcomes.events());
    }

    #[test]
    fn test_restore_skips_incomplete_events() {
        let xml = r#"<History events="3">
            <Event type="info" code="1" message="ok"/>
            <Event type="error" message="no code"/>
            <Event type="bogus" code="2" message="bad type"/>
        </History>"#;
        let mut restored = Outcomes::new();
        restored.restore_xml(xml).unwrap();
        assert_eq!(restored.events().len(), 1);
        assert_eq!(restored.severity(), Severity::Info);
    }
}
