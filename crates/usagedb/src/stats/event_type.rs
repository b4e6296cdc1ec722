//! Event type codes.

/// Unknown or unset.
pub const NONE: i32 = 0;
/// A component moved to the foreground.
pub const MOVE_TO_FOREGROUND: i32 = 1;
/// A component moved to the background.
pub const MOVE_TO_BACKGROUND: i32 = 2;
/// Marks the end of a daily bucket for a still-foreground component.
pub const END_OF_DAY: i32 = 3;
/// Carries a foreground component over from the previous bucket.
pub const CONTINUE_PREVIOUS_DAY: i32 = 4;
/// The device configuration changed.
pub const CONFIGURATION_CHANGE: i32 = 5;
/// The system interacted with the package.
pub const SYSTEM_INTERACTION: i32 = 6;
/// The user interacted with the package.
pub const USER_INTERACTION: i32 = 7;
/// A shortcut was invoked.
pub const SHORTCUT_INVOCATION: i32 = 8;
/// The package was chosen from a chooser.
pub const CHOOSER_ACTION: i32 = 9;
/// A notification was seen.
pub const NOTIFICATION_SEEN: i32 = 10;
/// The standby bucket of the package changed.
pub const STANDBY_BUCKET_CHANGED: i32 = 11;
/// A notification interrupted the user.
pub const NOTIFICATION_INTERRUPTION: i32 = 12;
/// A slice was pinned by a privileged app.
pub const SLICE_PINNED_PRIV: i32 = 13;
/// A slice was pinned.
pub const SLICE_PINNED: i32 = 14;
/// The screen became interactive.
pub const SCREEN_INTERACTIVE: i32 = 15;
/// The screen became non-interactive.
pub const SCREEN_NON_INTERACTIVE: i32 = 16;
/// The keyguard was shown.
pub const KEYGUARD_SHOWN: i32 = 17;
/// The keyguard was hidden.
pub const KEYGUARD_HIDDEN: i32 = 18;
