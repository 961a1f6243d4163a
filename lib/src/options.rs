//! The menu option tree.
//!
//! Stored as JSON keyed by owning mode, then by menu id (`"0"` is the root
//! page of a section). The menu mode edits it and sends it to owners in
//! [crate::bus::Payload::Settings] messages.

use std::collections::BTreeMap;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Address, ModeId};
use crate::modes::ids;

pub const ROOT_MENU: &str = "0";

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("no option {0}")]
    UnknownOption(String),
    #[error("option {option} does not take {value:?}")]
    TypeMismatch { option: String, value: OptionValue },
    #[error("failed to access option file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse option file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            OptionValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptionKind {
    Bool {
        value: bool,
    },
    Numeral {
        value: f64,
        min: f64,
        max: f64,
        step: f64,
    },
    Choice {
        value: String,
        choices: Vec<String>,
    },
    /// Opens another page of the same section.
    Submenu {
        target: String,
    },
    /// Moves focus to another mode.
    Action {
        target: ModeId,
    },
    /// Sends a command, then returns focus to the owner.
    Message {
        target: Address,
        payload: String,
    },
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionRecord {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: OptionKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Enabled while this bool is on, disabled while it is off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_enable: Vec<String>,
    /// Disabled while this bool is on, enabled while it is off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_disable: Vec<String>,
    /// Enabled only while all of these bools are on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable_with: Vec<String>,
    /// Also told about changes to this option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Address>,
}

impl OptionRecord {
    fn new(id: &str, label: &str, kind: OptionKind) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            kind,
            enabled: true,
            set_enable: Vec::new(),
            set_disable: Vec::new(),
            enable_with: Vec::new(),
            receiver: None,
        }
    }

    pub fn boolean(id: &str, label: &str, value: bool) -> Self {
        Self::new(id, label, OptionKind::Bool { value })
    }

    pub fn numeral(id: &str, label: &str, value: f64, min: f64, max: f64, step: f64) -> Self {
        Self::new(
            id,
            label,
            OptionKind::Numeral {
                value,
                min,
                max,
                step,
            },
        )
    }

    pub fn choice(id: &str, label: &str, value: &str, choices: &[&str]) -> Self {
        Self::new(
            id,
            label,
            OptionKind::Choice {
                value: value.to_string(),
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
        )
    }

    pub fn submenu(id: &str, label: &str, target: &str) -> Self {
        Self::new(
            id,
            label,
            OptionKind::Submenu {
                target: target.to_string(),
            },
        )
    }

    pub fn action(id: &str, label: &str, target: ModeId) -> Self {
        Self::new(id, label, OptionKind::Action { target })
    }

    pub fn message(id: &str, label: &str, target: Address, payload: &str) -> Self {
        Self::new(
            id,
            label,
            OptionKind::Message {
                target,
                payload: payload.to_string(),
            },
        )
    }

    pub fn with_set_disable(mut self, ids: &[&str]) -> Self {
        self.set_disable = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_enable_with(mut self, ids: &[&str]) -> Self {
        self.enable_with = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_receiver(mut self, receiver: Address) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// The current value, for kinds that carry one.
    pub fn value(&self) -> Option<OptionValue> {
        match &self.kind {
            OptionKind::Bool { value } => Some(OptionValue::Bool(*value)),
            OptionKind::Numeral { value, .. } => Some(OptionValue::Number(*value)),
            OptionKind::Choice { value, .. } => Some(OptionValue::Text(value.clone())),
            _ => None,
        }
    }

    /// Stores `value`, clamping numerals into range.
    pub fn set_value(&mut self, value: OptionValue) -> Result<(), OptionError> {
        let stored = match (&mut self.kind, &value) {
            (OptionKind::Bool { value: current }, OptionValue::Bool(new)) => {
                *current = *new;
                true
            }
            (
                OptionKind::Numeral {
                    value: current,
                    min,
                    max,
                    ..
                },
                OptionValue::Number(new),
            ) => {
                *current = new.clamp(*min, *max);
                true
            }
            (OptionKind::Choice { value: current, choices }, OptionValue::Text(new)) => {
                let known = choices.contains(new);
                if known {
                    *current = new.clone();
                }
                known
            }
            _ => false,
        };
        if !stored {
            return Err(OptionError::TypeMismatch {
                option: self.id.clone(),
                value,
            });
        }
        Ok(())
    }

    /// The value one step up or down from `current`, for editing.
    pub fn step(&self, current: &OptionValue, delta: i32) -> OptionValue {
        match (&self.kind, current) {
            (OptionKind::Numeral { min, max, step, .. }, OptionValue::Number(n)) => {
                OptionValue::Number((n + step * delta as f64).clamp(*min, *max))
            }
            (OptionKind::Choice { choices, .. }, OptionValue::Text(s)) if !choices.is_empty() => {
                let at = choices.iter().position(|c| c == s).unwrap_or(0) as i32;
                let len = choices.len() as i32;
                OptionValue::Text(choices[(at + delta).rem_euclid(len) as usize].clone())
            }
            _ => current.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuPage {
    pub title: String,
    pub options: Vec<OptionRecord>,
}

pub type Section = BTreeMap<String, MenuPage>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionTree {
    sections: BTreeMap<ModeId, Section>,
}

impl OptionTree {
    /// Loads the tree from `path`, falling back to [OptionTree::default_tree]
    /// if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Self, OptionError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} not found, using default menu", path.display());
                Ok(Self::default_tree())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), OptionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn insert_page(&mut self, owner: ModeId, menu_id: &str, page: MenuPage) {
        self.sections
            .entry(owner)
            .or_default()
            .insert(menu_id.to_string(), page);
    }

    pub fn section(&self, owner: &ModeId) -> Option<&Section> {
        self.sections.get(owner)
    }

    pub fn page(&self, owner: &ModeId, menu_id: &str) -> Option<&MenuPage> {
        self.sections.get(owner)?.get(menu_id)
    }

    pub fn find(&self, owner: &ModeId, option_id: &str) -> Option<&OptionRecord> {
        self.sections
            .get(owner)?
            .values()
            .flat_map(|page| page.options.iter())
            .find(|o| o.id == option_id)
    }

    pub fn find_mut(&mut self, owner: &ModeId, option_id: &str) -> Option<&mut OptionRecord> {
        self.sections
            .get_mut(owner)?
            .values_mut()
            .flat_map(|page| page.options.iter_mut())
            .find(|o| o.id == option_id)
    }

    pub fn value(&self, owner: &ModeId, option_id: &str) -> Option<OptionValue> {
        self.find(owner, option_id)?.value()
    }

    /// Stores a new value and recomputes which options are enabled.
    pub fn set_value(
        &mut self,
        owner: &ModeId,
        option_id: &str,
        value: OptionValue,
    ) -> Result<(), OptionError> {
        self.find_mut(owner, option_id)
            .ok_or_else(|| OptionError::UnknownOption(option_id.to_string()))?
            .set_value(value)?;
        self.apply_dependencies(owner);
        Ok(())
    }

    /// Recomputes `enabled` for every option of `owner` from the current
    /// bool values and their dependency lists.
    pub fn apply_dependencies(&mut self, owner: &ModeId) {
        let Some(section) = self.sections.get_mut(owner) else {
            return;
        };
        let bools: BTreeMap<String, bool> = section
            .values()
            .flat_map(|page| page.options.iter())
            .filter_map(|o| match o.kind {
                OptionKind::Bool { value } => Some((o.id.clone(), value)),
                _ => None,
            })
            .collect();

        let mut switched: Vec<(String, bool)> = Vec::new();
        for option in section.values().flat_map(|page| page.options.iter()) {
            if let OptionKind::Bool { value } = option.kind {
                switched.extend(option.set_enable.iter().map(|id| (id.clone(), value)));
                switched.extend(option.set_disable.iter().map(|id| (id.clone(), !value)));
            }
        }

        for option in section.values_mut().flat_map(|page| page.options.iter_mut()) {
            if let Some((_, enabled)) = switched.iter().rev().find(|(id, _)| *id == option.id) {
                option.enabled = *enabled;
            }
            if !option.enable_with.is_empty() {
                option.enabled = option
                    .enable_with
                    .iter()
                    .all(|id| bools.get(id).copied().unwrap_or(false));
            }
        }
    }

    /// The menu shipped with the appliance.
    pub fn default_tree() -> Self {
        let mut tree = OptionTree::default();
        let camera = ids::VIEWFINDER;
        tree.insert_page(
            camera.clone(),
            ROOT_MENU,
            MenuPage {
                title: "Camera".to_string(),
                options: vec![
                    OptionRecord::boolean("auto_exposure", "Auto exposure", true)
                        .with_set_disable(&["exposure_comp"]),
                    OptionRecord::numeral("exposure_comp", "Exposure comp", 0.0, -2.0, 2.0, 0.5),
                    OptionRecord::boolean("awb", "Auto white balance", true),
                    OptionRecord::choice("format", "Format", "png", &["png", "jpeg"]),
                    OptionRecord::choice(
                        "resolution",
                        "Resolution",
                        "2028x1520",
                        &["4056x3040", "2028x1520", "1332x990"],
                    ),
                    OptionRecord::boolean("show_info", "Info overlay", false),
                    OptionRecord::boolean("show_histogram", "Histogram", false)
                        .with_enable_with(&["show_info"]),
                    OptionRecord::submenu("system", "System", "1"),
                ],
            },
        );
        tree.insert_page(
            camera.clone(),
            "1",
            MenuPage {
                title: "System".to_string(),
                options: vec![
                    OptionRecord::action("gallery", "Gallery", ids::GALLERY),
                    OptionRecord::action("browser", "Media browser", ids::MEDIA_BROWSER),
                    OptionRecord::action("diagnostics", "Diagnostics", ids::DIAGNOSTICS),
                    OptionRecord::message("restart", "Restart", Address::Supervisor, "restart"),
                    OptionRecord::message("poweroff", "Power off", Address::Supervisor, "poweroff"),
                ],
            },
        );
        for browser in [ids::GALLERY, ids::MEDIA_BROWSER] {
            tree.insert_page(
                browser.clone(),
                ROOT_MENU,
                MenuPage {
                    title: browser.to_string(),
                    options: vec![
                        OptionRecord::message(
                            "delete",
                            "Delete",
                            Address::Mode(browser.clone()),
                            "delete",
                        ),
                        OptionRecord::message(
                            "refresh",
                            "Refresh",
                            Address::Mode(browser.clone()),
                            "refresh",
                        ),
                        OptionRecord::action("camera", "Camera", ids::VIEWFINDER),
                    ],
                },
            );
        }
        tree.apply_dependencies(&camera);
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_shape() {
        let record = OptionRecord::numeral("ev", "EV", 0.5, -2.0, 2.0, 0.5)
            .with_receiver(Address::Mode(ids::VIEWFINDER));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "numeral");
        assert_eq!(json["value"], 0.5);
        assert_eq!(json["receiver"], "Viewfinder");

        let back: OptionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_parses_hand_written_record() {
        let record: OptionRecord = serde_json::from_str(
            r#"{"id": "awb", "label": "AWB", "type": "bool", "value": false}"#,
        )
        .unwrap();
        assert!(record.enabled);
        assert_eq!(record.value(), Some(OptionValue::Bool(false)));
    }

    #[test]
    fn test_set_disable_dependency() {
        let mut tree = OptionTree::default_tree();
        let owner = ids::VIEWFINDER;
        assert!(!tree.find(&owner, "exposure_comp").unwrap().enabled);

        tree.set_value(&owner, "auto_exposure", OptionValue::Bool(false)).unwrap();
        assert!(tree.find(&owner, "exposure_comp").unwrap().enabled);
    }

    #[test]
    fn test_enable_with_dependency() {
        let mut tree = OptionTree::default_tree();
        let owner = ids::VIEWFINDER;
        assert!(!tree.find(&owner, "show_histogram").unwrap().enabled);
        tree.set_value(&owner, "show_info", OptionValue::Bool(true)).unwrap();
        assert!(tree.find(&owner, "show_histogram").unwrap().enabled);
    }

    #[test]
    fn test_numeral_is_clamped_and_typed() {
        let mut tree = OptionTree::default_tree();
        let owner = ids::VIEWFINDER;
        tree.set_value(&owner, "exposure_comp", OptionValue::Number(9.0)).unwrap();
        assert_eq!(tree.value(&owner, "exposure_comp"), Some(OptionValue::Number(2.0)));

        let err = tree.set_value(&owner, "exposure_comp", OptionValue::Bool(true));
        assert!(matches!(err, Err(OptionError::TypeMismatch { .. })));
        let err = tree.set_value(&owner, "nope", OptionValue::Bool(true));
        assert!(matches!(err, Err(OptionError::UnknownOption(_))));
    }

    #[test]
    fn test_choice_step_wraps() {
        let record = OptionRecord::choice("format", "Format", "png", &["png", "jpeg"]);
        let current = OptionValue::Text("jpeg".to_string());
        assert_eq!(record.step(&current, 1), OptionValue::Text("png".to_string()));
        assert_eq!(record.step(&current, -1), OptionValue::Text("png".to_string()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("menu.json");
        let mut tree = OptionTree::default_tree();
        tree.set_value(&ids::VIEWFINDER, "awb", OptionValue::Bool(false)).unwrap();
        tree.save(&path).unwrap();

        let loaded = OptionTree::load(&path).unwrap();
        assert_eq!(loaded, tree);
    }

    #[test]
    fn test_missing_file_gives_default() {
        let dir = tempfile::tempdir().unwrap();
        let tree = OptionTree::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(tree, OptionTree::default_tree());
    }
}
