//! Presence state shared through awareness messages.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Display identity of a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: SmolStr,
    pub name: SmolStr,
    /// Hex colour for cursor and avatar.
    pub color: SmolStr,
}

impl UserInfo {
    /// A user with the colour derived from their id.
    pub fn new(id: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
        let id = id.into();
        let color = SmolStr::new_static(color_from_user_id(&id));
        Self {
            id,
            name: name.into(),
            color,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
    #[default]
    Default,
    Pointer,
    Grab,
}

/// Pointer position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub x: f64,
    pub y: f64,
    pub kind: CursorKind,
    pub rotation: f64,
}

/// Camera position and zoom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

/// Everything one actor tells its peers about itself. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: UserInfo,
    /// `None` while the pointer is off the canvas.
    pub cursor: Option<CursorState>,
    /// Selected record ids.
    pub selection: Vec<SmolStr>,
    pub viewport: Option<Viewport>,
    /// Unix milliseconds of the last pointer, selection or edit activity.
    pub last_activity: u64,
    pub is_idle: bool,
}

impl AwarenessState {
    /// Fresh state for a newly connected actor.
    pub fn new(user: UserInfo, now_millis: u64) -> Self {
        Self {
            user,
            cursor: None,
            selection: Vec::new(),
            viewport: None,
            last_activity: now_millis,
            is_idle: false,
        }
    }
}

/// Palette picked for mutual distinctness on light and dark backgrounds.
pub const COLLABORATOR_COLORS: [&str; 12] = [
    "#FF6B6B", // Red
    "#4ECDC4", // Teal
    "#FFE66D", // Yellow
    "#95E1D3", // Mint
    "#F38181", // Coral
    "#6C5CE7", // Purple
    "#00B894", // Green
    "#FDCB6E", // Gold
    "#74B9FF", // Blue
    "#E17055", // Orange
    "#A29BFE", // Lavender
    "#55A3FF", // Sky
];

/// Deterministic colour for a user id, identical on every client.
///
/// djb2 over UTF-16 code units with 32-bit wrapping.
pub fn color_from_user_id(user_id: &str) -> &'static str {
    let mut hash: i32 = 0;
    for unit in user_id.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32);
    }
    let index = (hash as i64).unsigned_abs() as usize % COLLABORATOR_COLORS.len();
    COLLABORATOR_COLORS[index]
}

pub fn color_from_index(index: usize) -> &'static str {
    COLLABORATOR_COLORS[index % COLLABORATOR_COLORS.len()]
}
