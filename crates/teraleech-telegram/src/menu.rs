//! Settings panel and bot command list
//!
//! Inline keyboard menus for the admin settings panel

use serde::{Deserialize, Serialize};

pub const CALLBACK_VIEW_CONFIG: &str = "settings_view_config";
pub const CALLBACK_SET_DUMP_INFO: &str = "settings_set_dump_info";
pub const CALLBACK_SET_FSUB_INFO: &str = "settings_set_fsub_info";
pub const CALLBACK_CLOSE: &str = "settings_close";
pub const CALLBACK_MENU: &str = "settings_menu";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: &str, callback_data: &str) -> Self {
        Self {
            text: text.to_string(),
            callback_data: callback_data.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsAction {
    Menu,
    ViewConfig,
    DumpInfo,
    FsubInfo,
    Close,
}

impl SettingsAction {
    pub fn from_callback(data: &str) -> Option<Self> {
        match data {
            CALLBACK_VIEW_CONFIG => Some(SettingsAction::ViewConfig),
            CALLBACK_SET_DUMP_INFO => Some(SettingsAction::DumpInfo),
            CALLBACK_SET_FSUB_INFO => Some(SettingsAction::FsubInfo),
            CALLBACK_CLOSE => Some(SettingsAction::Close),
            CALLBACK_MENU => Some(SettingsAction::Menu),
            _ => None,
        }
    }
}

pub fn settings_menu() -> (String, Vec<Vec<InlineButton>>) {
    let text = "⚙️ <b>Bot Settings</b>\n\nChoose what to inspect or change:".to_string();
    let keyboard = vec![
        vec![InlineButton::new("📋 View Config", CALLBACK_VIEW_CONFIG)],
        vec![
            InlineButton::new("📤 Dump Channel", CALLBACK_SET_DUMP_INFO),
            InlineButton::new("📢 Force Sub", CALLBACK_SET_FSUB_INFO),
        ],
        vec![InlineButton::new("✖️ Close", CALLBACK_CLOSE)],
    ];
    (text, keyboard)
}

pub fn dump_channel_help() -> &'static str {
    "📤 <b>Dump Channel</b>\n\n\
     Send <code>/setdump -100xxxxxxxxxx</code> to upload every file to a channel.\n\
     Send <code>/setdump none</code> to deliver files to the requesting chat again.\n\n\
     The bot must be an admin of the channel."
}

pub fn force_sub_help() -> &'static str {
    "📢 <b>Force Subscribe</b>\n\n\
     Send <code>/setfsub @channel</code> or <code>/setfsub -100xxxxxxxxxx</code> to store a channel.\n\
     Send <code>/setfsub none</code> to clear it."
}

pub fn back_keyboard() -> Vec<Vec<InlineButton>> {
    vec![vec![InlineButton::new("⬅️ Back", CALLBACK_MENU)]]
}

pub fn bot_commands() -> serde_json::Value {
    serde_json::json!([
        {"command": "start", "description": "Show welcome message"},
        {"command": "help", "description": "How to use the bot"},
        {"command": "settings", "description": "Admin settings panel"},
        {"command": "setdump", "description": "Set or clear the dump channel"},
        {"command": "setfsub", "description": "Set or clear the force-sub channel"},
        {"command": "viewconfig", "description": "Show current settings"},
        {"command": "logs", "description": "Show recent log lines"}
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_settings_button_maps_to_an_action() {
        let (_, keyboard) = settings_menu();
        for button in keyboard.iter().flatten() {
            assert!(
                SettingsAction::from_callback(&button.callback_data).is_some(),
                "unmapped callback {}",
                button.callback_data
            );
        }
    }

    #[test]
    fn unknown_callback_is_ignored() {
        assert_eq!(SettingsAction::from_callback("something_else"), None);
    }

    #[test]
    fn command_list_includes_admin_commands() {
        let commands = bot_commands();
        let names: Vec<&str> = commands
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|c| c["command"].as_str())
            .collect();
        assert!(names.contains(&"setdump"));
        assert!(names.contains(&"logs"));
    }
}
