//! Log agent filter refinement tree.
//!
//! The root admits every configured variant. Each refinement narrows its
//! parent's own set by name, type or group, and the agents left enabled are
//! the union of the leaves. Siblings must all include or all exclude.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::LogAgentConfig;
use crate::persist::{expect_start, required_attribute, PersistResult, Persistent};
use crate::variables::same_text;
use crate::xml::{XmlPullSource, XmlResult, XmlWriter};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogAgentVariant {
    name: String,
    variant_type: String,
    group: String,
}

impl LogAgentVariant {
    pub fn new(name: &str, variant_type: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            variant_type: variant_type.to_string(),
            group: group.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant_type(&self) -> &str {
        &self.variant_type
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn field(&self, kind: MatchKind) -> &str {
        match kind {
            MatchKind::Unfiltered => "",
            MatchKind::Name => &self.name,
            MatchKind::Type => &self.variant_type,
            MatchKind::Group => &self.group,
        }
    }
}

impl From<&LogAgentConfig> for LogAgentVariant {
    fn from(config: &LogAgentConfig) -> Self {
        Self::new(&config.name, &config.variant_type, &config.group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FilterMode {
    #[strum(serialize = "inclusive", serialize = "include")]
    Inclusive,
    #[strum(serialize = "exclusive", serialize = "exclude")]
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MatchKind {
    Unfiltered,
    Name,
    Type,
    Group,
}

/// Empty patterns only match empty values, `*` matches anything, and any
/// other pattern is a case-insensitive comparison.
fn is_match(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        value.is_empty()
    } else if pattern == "*" {
        true
    } else {
        same_text(pattern, value)
    }
}

#[derive(Debug, Clone)]
pub struct LogAgentFilter {
    mode: FilterMode,
    kind: MatchKind,
    pattern: String,
    included: Vec<Arc<LogAgentVariant>>,
    refinements: Vec<LogAgentFilter>,
}

impl LogAgentFilter {
    pub fn unfiltered(variants: Vec<Arc<LogAgentVariant>>) -> Self {
        Self {
            mode: FilterMode::Inclusive,
            kind: MatchKind::Unfiltered,
            pattern: String::new(),
            included: variants,
            refinements: Vec::new(),
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Variants this node itself admits, ignoring refinements.
    pub fn included(&self) -> &[Arc<LogAgentVariant>] {
        &self.included
    }

    pub fn refinements(&self) -> &[LogAgentFilter] {
        &self.refinements
    }

    pub fn refinement_mut(&mut self, index: usize) -> Option<&mut LogAgentFilter> {
        self.refinements.get_mut(index)
    }

    /// Adds a child narrowing this node's own set. Returns `None` when
    /// existing children use the other mode.
    pub fn refine(
        &mut self,
        mode: FilterMode,
        kind: MatchKind,
        pattern: &str,
    ) -> Option<&mut LogAgentFilter> {
        if self.refinements.first().map_or(false, |r| r.mode != mode) {
            debug!(%mode, "refinement mode conflicts with existing siblings");
            return None;
        }
        let keep = mode == FilterMode::Inclusive;
        let included = self
            .included
            .iter()
            .filter(|variant| {
                let matched = kind == MatchKind::Unfiltered || is_match(pattern, variant.field(kind));
                matched == keep
            })
            .cloned()
            .collect();
        self.refinements.push(LogAgentFilter {
            mode,
            kind,
            pattern: pattern.to_string(),
            included,
            refinements: Vec::new(),
        });
        self.refinements.last_mut()
    }

    pub fn include_name(&mut self, pattern: &str) -> Option<&mut LogAgentFilter> {
        self.refine(FilterMode::Inclusive, MatchKind::Name, pattern)
    }

    pub fn exclude_name(&mut self, pattern: &str) -> Option<&mut LogAgentFilter> {
        self.refine(FilterMode::Exclusive, MatchKind::Name, pattern)
    }

    pub fn include_type(&mut self, pattern: &str) -> Option<&mut LogAgentFilter> {
        self.refine(FilterMode::Inclusive, MatchKind::Type, pattern)
    }

    pub fn exclude_type(&mut self, pattern: &str) -> Option<&mut LogAgentFilter> {
        self.refine(FilterMode::Exclusive, MatchKind::Type, pattern)
    }

    pub fn include_group(&mut self, pattern: &str) -> Option<&mut LogAgentFilter> {
        self.refine(FilterMode::Inclusive, MatchKind::Group, pattern)
    }

    pub fn exclude_group(&mut self, pattern: &str) -> Option<&mut LogAgentFilter> {
        self.refine(FilterMode::Exclusive, MatchKind::Group, pattern)
    }

    /// With `recurse`, a node that has refinements admits what any of them
    /// admits; otherwise only the node's own set is consulted.
    pub fn includes(&self, variant: &LogAgentVariant, recurse: bool) -> bool {
        if !recurse || self.refinements.is_empty() {
            self.included.iter().any(|v| v.as_ref() == variant)
        } else {
            self.refinements.iter().any(|r| r.includes(variant, true))
        }
    }

    pub fn excludes(&self, variant: &LogAgentVariant, recurse: bool) -> bool {
        !self.includes(variant, recurse)
    }

    pub fn reset(&mut self) {
        self.refinements.clear();
    }
}

/// Per-transaction filter state over the configured variant universe.
#[derive(Debug, Clone)]
pub struct LogAgentState {
    universe: Vec<Arc<LogAgentVariant>>,
    root: LogAgentFilter,
}

impl Default for LogAgentState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LogAgentState {
    pub fn new(universe: Vec<Arc<LogAgentVariant>>) -> Self {
        Self {
            root: LogAgentFilter::unfiltered(universe.clone()),
            universe,
        }
    }

    pub fn universe(&self) -> &[Arc<LogAgentVariant>] {
        &self.universe
    }

    pub fn root(&self) -> &LogAgentFilter {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut LogAgentFilter {
        &mut self.root
    }

    /// Follows refinement indices down from the root.
    pub fn filter_at(&mut self, path: &[usize]) -> Option<&mut LogAgentFilter> {
        let mut node = &mut self.root;
        for index in path {
            node = node.refinement_mut(*index)?;
        }
        Some(node)
    }

    pub fn is_enabled(&self, variant: &LogAgentVariant) -> bool {
        self.root.includes(variant, true)
    }

    pub fn enabled_variants(&self) -> Vec<Arc<LogAgentVariant>> {
        self.universe
            .iter()
            .filter(|v| self.is_enabled(v))
            .cloned()
            .collect()
    }

    /// Back to every variant enabled.
    pub fn reset(&mut self) {
        self.root = LogAgentFilter::unfiltered(self.universe.clone());
    }
}

impl Persistent for LogAgentState {
    const ELEMENT: &'static str = "LogAgentState";

    fn persist(&self, writer: &mut XmlWriter) -> XmlResult<()> {
        let count = self.universe.len().to_string();
        writer.start(Self::ELEMENT, &[("variants", &count)])?;
        for variant in &self.universe {
            let enabled = if self.is_enabled(variant) { "1" } else { "0" };
            writer.empty(
                "Variant",
                &[
                    ("name", variant.name()),
                    ("type", variant.variant_type()),
                    ("group", variant.group()),
                    ("enabled", enabled),
                ],
            )?;
        }
        writer.end(Self::ELEMENT)
    }

    /// Rebuilds the root from the persisted enabled flags. Variants without
    /// a usable entry keep their current state. Refinements are not
    /// persisted, so the restored root has none.
    fn restore(&mut self, source: &mut dyn XmlPullSource) -> PersistResult<()> {
        expect_start(source, Self::ELEMENT)?;
        let mut flags: Vec<bool> = self.universe.iter().map(|v| self.is_enabled(v)).collect();
        while source.next() {
            if source.at_end_tag(Some(Self::ELEMENT)) {
                break;
            }
            if !source.at_start_tag(None) {
                continue;
            }
            if source.at_start_tag(Some("Variant")) {
                let name = required_attribute(source, "Variant", "name");
                let flag = required_attribute(source, "Variant", "enabled");
                if let (Some(name), Some(flag)) = (name, flag) {
                    let variant_type = source.current_attribute("type").unwrap_or_default();
                    let group = source.current_attribute("group").unwrap_or_default();
                    let known = self.universe.iter().position(|v| {
                        v.name() == name && v.variant_type() == variant_type && v.group() == group
                    });
                    match known {
                        Some(index) => flags[index] = flag == "1",
                        None => warn!("ignoring unconfigured log agent variant '{}'", name),
                    }
                }
            }
            source.skip();
        }
        let enabled = self
            .universe
            .iter()
            .zip(flags)
            .filter(|(_, enabled)| *enabled)
            .map(|(variant, _)| variant.clone())
            .collect();
        self.root = LogAgentFilter::unfiltered(enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn universe() -> Vec<Arc<LogAgentVariant>> {
        vec![
            Arc::new(LogAgentVariant::new("A", "file", "g1")),
            Arc::new(LogAgentVariant::new("B", "db", "g2")),
            Arc::new(LogAgentVariant::new("C", "", "G1")),
        ]
    }

    fn names(variants: &[Arc<LogAgentVariant>]) -> Vec<&str> {
        variants.iter().map(|v| v.name()).collect()
    }

    #[test]
    fn test_include_then_mixed_mode_is_rejected() {
        let mut state = LogAgentState::new(universe());
        let child = state.root_mut().include_group("g1").unwrap();
        assert_eq!(names(child.included()), vec!["A", "C"]);
        assert!(state.root_mut().exclude_name("B").is_none());
        assert_eq!(names(&state.enabled_variants()), vec!["A", "C"]);
    }

    #[test]
    fn test_exclude_and_nested_refinement() {
        let mut state = LogAgentState::new(universe());
        let child = state.root_mut().exclude_type("db").unwrap();
        assert_eq!(names(child.included()), vec!["A", "C"]);
        child.include_name("a").unwrap();
        assert_eq!(names(&state.enabled_variants()), vec!["A"]);
        assert!(state.root().includes(&universe()[2], false));
        assert!(state.root().excludes(&universe()[2], true));
    }

    #[test]
    fn test_pattern_rules() {
        assert!(is_match("", ""));
        assert!(!is_match("", "x"));
        assert!(is_match("*", "anything"));
        assert!(is_match("FILE", "file"));
        assert!(is_match("ÄUDIT", "äudit"));
        assert_eq!(crate::variables::fold_name("ÄUDIT"), "äudit");
        let mut state = LogAgentState::new(universe());
        let child = state.root_mut().include_type("").unwrap();
        assert_eq!(names(child.included()), vec!["C"]);
    }

    #[test]
    fn test_sibling_union_and_reset() {
        let mut state = LogAgentState::new(universe());
        state.root_mut().include_name("A");
        state.root_mut().include_name("B");
        assert_eq!(names(&state.enabled_variants()), vec!["A", "B"]);
        state.root_mut().reset();
        assert_eq!(state.enabled_variants().len(), 3);
    }

    #[test]
    fn test_persist_round_trip() {
        let mut state = LogAgentState::new(universe());
        state.root_mut().include_group("g2");
        let xml = state.to_xml().unwrap();

        let mut restored = LogAgentState::new(universe());
        restored.restore_xml(&xml).unwrap();
        assert_eq!(names(&restored.enabled_variants()), vec!["B"]);
        assert!(restored.root().refinements().is_empty());
    }

    #[test]
    fn test_restore_skips_bad_entries() {
        let xml = r#"<LogAgentState variants="3">
            <Variant type="file" group="g1" enabled="0"/>
            <Variant name="B" type="db" group="g2" enabled="0"/>
            <Variant name="Z" enabled="1"/>
            <Variant name="C" type="" group="G1"/>
        </LogAgentState>"#;
        let mut state = LogAgentState::new(universe());
        state.restore_xml(xml).unwrap();
        assert_eq!(names(&state.enabled_variants()), vec!["A", "C"]);

        let mut narrowed = LogAgentState::new(universe());
        narrowed.root_mut().include_name("B");
        narrowed
            .restore_xml(r#"<LogAgentState variants="1"><Variant name="A" type="file" group="g1" enabled="1"/></LogAgentState>"#)
            .unwrap();
        assert_eq!(names(&narrowed.enabled_variants()), vec!["A", "B"]);
    }

    proptest::proptest! {
        #[test]
        fn prop_include_and_exclude_partition_the_universe(pattern in "[a-dA-D*]") {
            let mut included = LogAgentState::new(universe());
            included.root_mut().include_name(&pattern);
            let mut excluded = LogAgentState::new(universe());
            excluded.root_mut().exclude_name(&pattern);

            for variant in universe() {
                proptest::prop_assert_ne!(
                    included.is_enabled(&variant),
                    excluded.is_enabled(&variant)
                );
            }
        }
    }
}
