//! Frame-scoped variable stack.
//!
//! Frames are numbered from zero. Frame 0 holds globals and is never popped;
//! by convention frame 1 is the script frame and frame 2 the phase frame.
//! Lookups run newest to oldest, and names compare case-insensitively.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::persist::{required_attribute, expect_start, PersistError, Persistent};
use crate::xml::{XmlPullSource, XmlResult, XmlWriter};

pub const GLOBAL_FRAME: usize = 0;
pub const SCRIPT_FRAME: usize = 1;
pub const PHASE_FRAME: usize = 2;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum VariableState {
    Declared,
    Defined,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariableError {
    #[error("frame {frame} does not exist (depth {depth})")]
    InvalidFrame { frame: usize, depth: usize },
    #[error("variable name is empty")]
    EmptyName,
    #[error("variable '{name}' is already defined in frame {frame}")]
    Redefinition { name: String, frame: usize },
    #[error("the global frame cannot be popped")]
    GlobalFrame,
}

pub type VariableResult<T> = Result<T, VariableError>;

/// Receives changes to the value visible for a name. `None` means the name is
/// no longer defined anywhere on the stack.
pub trait VariableListener {
    fn on_variable_change(&self, name: &str, value: Option<&str>);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub state: VariableState,
    pub frame: usize,
}

/// Human readable label for a frame index.
pub fn frame_label(frame: usize) -> &'static str {
    match frame {
        GLOBAL_FRAME => "global",
        SCRIPT_FRAME => "script",
        PHASE_FRAME => "phase",
        _ => "block",
    }
}

type Frame = BTreeMap<String, Variable>;

/// Case folding shared by every case-insensitive name in the crate.
pub(crate) fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

pub(crate) fn same_text(lhs: &str, rhs: &str) -> bool {
    fold_name(lhs) == fold_name(rhs)
}

pub struct Variables {
    frames: Vec<Frame>,
    listener: Option<Box<dyn VariableListener>>,
}

impl fmt::Debug for Variables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variables")
            .field("frames", &self.frames)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Variables {
    /// Creates a stack holding only the global frame.
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::new()],
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn VariableListener>) {
        self.listener = Some(listener);
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn push_frame(&mut self) -> usize {
        self.frames.push(Frame::new());
        let frame = self.current_frame();
        debug!("pushed {} variable frame {}", frame_label(frame), frame);
        frame
    }

    /// Removes the newest frame, telling the listener what each of its names
    /// resolves to afterwards.
    pub fn pop_frame(&mut self) -> VariableResult<()> {
        if self.frames.len() <= 1 {
            return Err(VariableError::GlobalFrame);
        }
        let Some(popped) = self.frames.pop() else {
            return Err(VariableError::GlobalFrame);
        };
        if let Some(listener) = &self.listener {
            for variable in popped.values() {
                let visible = self.query_variable_in(&variable.name, self.current_frame(), 0);
                listener.on_variable_change(&variable.name, visible.map(|v| v.value.as_str()));
            }
        }
        debug!("popped variable frame {}", self.frames.len());
        Ok(())
    }

    pub fn declare_variable(&mut self, name: &str, value: &str, frame: usize) -> VariableResult<()> {
        self.add_variable(VariableState::Declared, name, value, frame)
    }

    pub fn define_variable(&mut self, name: &str, value: &str, frame: usize) -> VariableResult<()> {
        self.add_variable(VariableState::Defined, name, value, frame)
    }

    pub fn add_variable(
        &mut self,
        state: VariableState,
        name: &str,
        value: &str,
        frame: usize,
    ) -> VariableResult<()> {
        if frame >= self.frames.len() {
            return Err(VariableError::InvalidFrame {
                frame,
                depth: self.frames.len(),
            });
        }
        if name.trim().is_empty() {
            return Err(VariableError::EmptyName);
        }

        let shadowed = frame < self.current_frame()
            && self
                .query_variable_in(name, self.current_frame(), frame + 1)
                .is_some();
        if let Some(existing) = self.frames[frame].get_mut(&fold_name(name)) {
            match (existing.state, state) {
                (VariableState::Declared, VariableState::Defined) => {
                    existing.state = VariableState::Defined;
                    if !same_text(&existing.value, value) {
                        existing.value = value.to_string();
                        if !shadowed {
                            self.notify(name, Some(value));
                        }
                    }
                    Ok(())
                }
                (VariableState::Defined, VariableState::Defined) => Err(VariableError::Redefinition {
                    name: name.to_string(),
                    frame,
                }),
                _ => Ok(()),
            }
        } else {
            let previous = if frame > 0 {
                self.query_variable_in(name, frame - 1, 0)
                    .map(|v| v.value.clone())
            } else {
                None
            };
            self.frames[frame].insert(
                fold_name(name),
                Variable {
                    name: name.to_string(),
                    value: value.to_string(),
                    state,
                    frame,
                },
            );
            let changed = previous.map_or(true, |p| !same_text(&p, value));
            if !shadowed && changed {
                self.notify(name, Some(value));
            }
            Ok(())
        }
    }

    fn notify(&self, name: &str, value: Option<&str>) {
        if let Some(listener) = &self.listener {
            listener.on_variable_change(name, value);
        }
    }

    /// Newest visible definition of `name`.
    pub fn query_variable(&self, name: &str) -> Option<&Variable> {
        self.query_variable_in(name, self.current_frame(), 0)
    }

    /// Searches frames `max_frame` down to `min_frame` inclusive.
    pub fn query_variable_in(&self, name: &str, max_frame: usize, min_frame: usize) -> Option<&Variable> {
        let key = fold_name(name);
        let top = max_frame.min(self.current_frame());
        if min_frame > top {
            return None;
        }
        (min_frame..=top)
            .rev()
            .find_map(|frame| self.frames[frame].get(&key))
    }

    pub fn is_variable(&self, name: &str) -> bool {
        self.query_variable(name).is_some()
    }

    /// Variables in frames `max_frame` down to `min_frame`, newest frame first.
    pub fn variables(&self, max_frame: usize, min_frame: usize) -> impl Iterator<Item = &Variable> {
        let top = max_frame.min(self.current_frame());
        let range = if min_frame > top { 1..1 } else { min_frame..top + 1 };
        range.rev().flat_map(move |frame| self.frames[frame].values())
    }

    /// Value visible for every name on the stack.
    pub fn visible(&self) -> Vec<(String, String)> {
        let mut seen: BTreeMap<String, (String, String)> = BTreeMap::new();
        for variable in self.variables(self.current_frame(), 0) {
            seen.entry(fold_name(&variable.name))
                .or_insert_with(|| (variable.name.clone(), variable.value.clone()));
        }
        seen.into_values().collect()
    }
}

impl Persistent for Variables {
    const ELEMENT: &'static str = "Variables";

    fn persist(&self, writer: &mut XmlWriter) -> XmlResult<()> {
        let frames = self.frames.len().to_string();
        writer.start(Self::ELEMENT, &[("frames", &frames)])?;
        for (index, frame) in self.frames.iter().enumerate() {
            let index_text = index.to_string();
            let count = frame.len().to_string();
            writer.start(
                "Frame",
                &[
                    ("index", &index_text),
                    ("label", frame_label(index)),
                    ("variables", &count),
                ],
            )?;
            for variable in frame.values() {
                let state = variable.state.to_string();
                writer.empty(
                    "Variable",
                    &[
                        ("name", &variable.name),
                        ("value", &variable.value),
                        ("state", &state),
                    ],
                )?;
            }
            writer.end("Frame")?;
        }
        writer.end(Self::ELEMENT)
    }

    /// Frames are rebuilt into a fresh stack; the current one is replaced
    /// only if every frame index is valid. The listener is kept but not
    /// notified.
    fn restore(&mut self, source: &mut dyn XmlPullSource) -> Result<(), PersistError> {
        expect_start(source, Self::ELEMENT)?;
        let declared = source
            .current_attribute("frames")
            .map(str::to_string)
            .unwrap_or_default();
        let count = declared
            .parse::<usize>()
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| PersistError::InvalidFrameCount(declared.clone()))?;

        let mut frames: Vec<Option<Frame>> = vec![None; count];
        while source.next() {
            if source.at_end_tag(Some(Self::ELEMENT)) {
                break;
            }
            if !source.at_start_tag(None) {
                continue;
            }
            if !source.at_start_tag(Some("Frame")) {
                source.skip();
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
            frames[index] = Some(read_frame(source, index)?);
        }

        let mut restored = Vec::with_capacity(count);
        for (index, frame) in frames.into_iter().enumerate() {
            restored.push(frame.ok_or_else(|| PersistError::InvalidFrameIndex(index.to_string()))?);
        }
        self.frames = restored;
        Ok(())
    }
}

fn read_frame(source: &mut dyn XmlPullSource, index: usize) -> Result<Frame, PersistError> {
    let mut frame = Frame::new();
    while source.next() {
        if source.at_end_tag(Some("Frame")) {
            break;
        }
        if !source.at_start_tag(None) {
            continue;
        }
        if source.at_start_tag(Some("Variable")) {
            let name = required_attribute(source, "Variable", "name");
            let value = source.current_attribute("value").map(str::to_string);
            let state = source
                .current_attribute("state")
                .and_then(|s| s.parse::<VariableState>().ok())
                .unwrap_or(VariableState::Defined);
            match (name, value) {
                (Some(name), Some(value)) if !name.trim().is_empty() => {
                    if frame.contains_key(&fold_name(&name)) {
                        warn!("skipping duplicate variable '{}' in frame {}", name, index);
                    } else {
                        frame.insert(
                            fold_name(&name),
                            Variable {
                                name,
                                value,
                                state,
                                frame: index,
                            },
                        );
                    }
                }
                (name, _) => warn!(
                    "skipping incomplete variable {:?} in frame {}",
                    name.unwrap_or_default(),
                    index
                ),
            }
        }
        source.skip();
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<(String, Option<String>)>>>);

    impl VariableListener for Recorder {
        fn on_variable_change(&self, name: &str, value: Option<&str>) {
            self.0
                .lock()
                .unwrap()
                .push((name.to_string(), value.map(str::to_string)));
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<(String, Option<String>)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn stack_with_recorder() -> (Variables, Recorder) {
        let recorder = Recorder::default();
        let mut variables = Variables::new();
        variables.set_listener(Box::new(recorder.clone()));
        (variables, recorder)
    }

    #[test]
    fn test_shadowing_and_pop() {
        let (mut vars, recorder) = stack_with_recorder();
        vars.define_variable("x", "a", GLOBAL_FRAME).unwrap();
        let frame = vars.push_frame();
        vars.define_variable("x", "b", frame).unwrap();
        assert_eq!(vars.query_variable("x").unwrap().value, "b");
        assert_eq!(vars.query_variable_in("X", GLOBAL_FRAME, GLOBAL_FRAME).unwrap().value, "a");

        vars.pop_frame().unwrap();
        assert_eq!(vars.query_variable("x").unwrap().value, "a");
        assert_eq!(
            recorder.take(),
            vec![
                ("x".to_string(), Some("a".to_string())),
                ("x".to_string(), Some("b".to_string())),
                ("x".to_string(), Some("a".to_string())),
            ]
        );
    }

    #[test]
    fn test_pop_reports_undefined() {
        let (mut vars, recorder) = stack_with_recorder();
        let frame = vars.push_frame();
        vars.define_variable("only", "1", frame).unwrap();
        vars.pop_frame().unwrap();
        assert_eq!(recorder.take().last(), Some(&("only".to_string(), None)));
        assert!(!vars.is_variable("only"));
    }

    #[test]
    fn test_redefinition_rules() {
        let (mut vars, recorder) = stack_with_recorder();
        vars.declare_variable("mode", "default", GLOBAL_FRAME).unwrap();
        recorder.take();

        vars.define_variable("MODE", "custom", GLOBAL_FRAME).unwrap();
        assert_eq!(
            recorder.take(),
            vec![("MODE".to_string(), Some("custom".to_string()))]
        );
        assert_eq!(vars.query_variable("mode").unwrap().state, VariableState::Defined);

        assert_eq!(
            vars.define_variable("mode", "again", GLOBAL_FRAME),
            Err(VariableError::Redefinition {
                name: "mode".to_string(),
                frame: GLOBAL_FRAME
            })
        );
        assert!(vars.declare_variable("mode", "ignored", GLOBAL_FRAME).is_ok());
        assert_eq!(vars.query_variable("mode").unwrap().value, "custom");
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_shadowed_definition_does_not_notify() {
        let (mut vars, recorder) = stack_with_recorder();
        vars.declare_variable("mode", "default", GLOBAL_FRAME).unwrap();
        let frame = vars.push_frame();
        vars.define_variable("mode", "inner", frame).unwrap();
        recorder.take();

        vars.define_variable("mode", "outer", GLOBAL_FRAME).unwrap();
        assert!(recorder.take().is_empty());
        assert_eq!(vars.query_variable("mode").unwrap().value, "inner");

        vars.pop_frame().unwrap();
        assert_eq!(
            recorder.take(),
            vec![("mode".to_string(), Some("outer".to_string()))]
        );
    }

    #[test]
    fn test_same_text_does_not_notify() {
        let (mut vars, recorder) = stack_with_recorder();
        vars.define_variable("x", "Value", GLOBAL_FRAME).unwrap();
        let frame = vars.push_frame();
        recorder.take();
        vars.define_variable("x", "VALUE", frame).unwrap();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_frame_errors() {
        let mut vars = Variables::new();
        assert_eq!(vars.pop_frame(), Err(VariableError::GlobalFrame));
        assert_eq!(
            vars.define_variable("x", "1", 3),
            Err(VariableError::InvalidFrame { frame: 3, depth: 1 })
        );
        assert_eq!(vars.define_variable(" ", "1", 0), Err(VariableError::EmptyName));
    }

    #[test]
    fn test_persist_round_trip() {
        let mut vars = Variables::new();
        vars.define_variable("a", "1", GLOBAL_FRAME).unwrap();
        let frame = vars.push_frame();
        vars.declare_variable("b", "<2>", frame).unwrap();
        let xml = vars.to_xml().unwrap();

        let mut restored = Variables::new();
        restored.restore_xml(&xml).unwrap();
        assert_eq!(restored.depth(), 2);
        assert_eq!(restored.query_variable("b").unwrap().value, "<2>");
        assert_eq!(restored.query_variable("b").unwrap().state, VariableState::Declared);
        assert_eq!(restored.visible(), vars.visible());
    }

    #[test]
    fn test_restore_rejects_bad_frames() {
        let mut vars = Variables::new();
        vars.define_variable("keep", "1", GLOBAL_FRAME).unwrap();
        let duplicate = r#"<Variables frames="2"><Frame index="0"/><Frame index="0"/></Variables>"#;
        assert!(matches!(
            vars.restore_xml(duplicate),
            Err(PersistError::DuplicateFrame(0))
        ));
        assert!(vars.restore_xml(r#"<Variables frames="0"/>"#).is_err());
        assert!(vars.is_variable("keep"));
    }

    #[test]
    fn test_restore_skips_incomplete_entries() {
        let xml = r#"<Variables frames="1"><Frame index="0">
            <Variable name="a" value="1" state="defined"/>
            <Variable value="orphan"/>
            <Variable name="b"/>
            <Variable name="A" value="dup"/>
        </Frame></Variables>"#;
        let mut vars = Variables::new();
        vars.restore_xml(xml).unwrap();
        assert_eq!(vars.visible(), vec![("a".to_string(), "1".to_string())]);
    }

    proptest! {
        #[test]
        fn prop_newest_frame_wins(values in proptest::collection::vec("[a-z]{1,6}", 1..6)) {
            let mut vars = Variables::new();
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    vars.push_frame();
                }
                vars.define_variable("v", value, index).unwrap();
            }
            for expected in values.iter().rev() {
                prop_assert_eq!(&vars.query_variable("v").unwrap().value, expected);
                if vars.depth() > 1 {
                    vars.pop_frame().unwrap();
                }
            }
        }
    }
}
