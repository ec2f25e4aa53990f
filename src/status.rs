//! ==============================================================================
//! status.rs - on-device status surface
//! ==============================================================================
//!
//! purpose:
//!     every screen the device draws: boot progress rows, the fault screen,
//!     the periodic status page and the developer-mode banner.
//!
//! layout (128x160 portrait, size-1 glyphs are 6x8, size-2 are 12x16):
//!
//! ```text
//!     ┌──────────────┐
//!     │ == Sensors ==│  y=0    label/name per sensor, reading below it
//!     │ 1 Freezer    │
//!     │   -2.30 F    │
//!     │ ==  WiFi   ==│  y=74   SSID/IP or ****DISCONNECTED****
//!     │ == Updates ==│  y=123  last read, last push
//!     └──────────────┘
//! ```
//!
//! relationships:
//!     - used by: bringup.rs, runtime.rs
//!     - uses: hal::DisplaySurface
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::domain::DeviceState;
use crate::error::DisplayError;
use crate::hal::{Color, DisplaySurface};

type DrawResult = std::result::Result<(), DisplayError>;

/// Characters per line of the fault screen.
pub const FAULT_LINE_WIDTH: usize = 20;

/// Boot progress rows, one y coordinate each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRow {
    Starting,
    Version,
    Screen,
    Sensors,
    Wifi,
    Clock,
    Date,
    Config,
    Booting,
}

impl BootRow {
    pub fn y(self) -> i32 {
        match self {
            BootRow::Starting => 0,
            BootRow::Version => 18,
            BootRow::Screen => 36,
            BootRow::Sensors => 54,
            BootRow::Wifi => 72,
            BootRow::Clock => 90,
            BootRow::Date => 108,
            BootRow::Config => 126,
            BootRow::Booting => 144,
        }
    }
}

/// One boot progress line. Drawing problems after init are logged only.
pub fn boot_line(display: &mut dyn DisplaySurface, row: BootRow, text: &str, color: Color) {
    let x = if row == BootRow::Starting { 15 } else { 0 };
    if let Err(e) = display.text((x, row.y()), text, color, 2) {
        warn!("Could not draw boot line {:?}: {}", text, e);
    }
}

/// Split `message` into screen lines of at most [`FAULT_LINE_WIDTH`] characters.
pub fn wrap_fault(message: &str) -> Vec<String> {
    let chars: Vec<char> = message.chars().collect();
    chars.chunks(FAULT_LINE_WIDTH).map(|chunk| chunk.iter().collect()).collect()
}

/// Clear the screen and show `message` in red under an `*EXCEPTION*` header.
/// Also logged, since the screen may be the thing that is broken.
pub fn show_fault(display: &mut dyn DisplaySurface, message: &str) {
    error!("{}", message);
    if let Err(e) = draw_fault(display, message) {
        warn!("Could not draw fault screen: {}", e);
    }
}

fn draw_fault(display: &mut dyn DisplaySurface, message: &str) -> DrawResult {
    display.fill(Color::Black)?;
    display.text((0, 5), "*EXCEPTION*", Color::Red, 2)?;
    let mut y = 25;
    for line in wrap_fault(message) {
        display.text((0, y), &line, Color::Red, 1)?;
        y += 10;
    }
    Ok(())
}

/// `HH:MM:SS (UTC)`
pub fn clock_text(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S (UTC)").to_string()
}

/// Redraw the periodic status page from `state`.
pub fn render_status(display: &mut dyn DisplaySurface, state: &DeviceState) -> DrawResult {
    display.fill(Color::Black)?;

    // sensors
    section_header(display, 0, 24, 27, "Sensors")?;
    let mut y = 17;
    for sensor in &state.sensors {
        let color = if sensor.is_active() { Color::White } else { Color::Yellow };
        display.text((0, y), &format!("{} {}", sensor.label(), sensor.display_name()), color, 1)?;
        y += 10;
        match sensor.last_temperature_f() {
            Some(f) => display.text((27, y), &format!("{:.2} F", f), Color::White, 2)?,
            None => display.text((27, y), "NULL", Color::Yellow, 1)?,
        }
        y += 17;
    }

    // wifi
    section_header(display, 74, 40, 44, "WiFi")?;
    match &state.wifi {
        Some(wifi) => {
            display.text((0, 90), "Connected!", Color::Green, 1)?;
            display.text((0, 100), &format!("SSID: {}", wifi.ssid), Color::White, 1)?;
            display.text((0, 110), &format!("IP: {}", wifi.ip), Color::White, 1)?;
        }
        None => display.text((0, 90), "****DISCONNECTED****", Color::Red, 1)?,
    }

    // updates
    section_header(display, 123, 24, 27, "Updates")?;
    match state.last_sensed_at {
        Some(at) => display.text((0, 140), &format!("Read: {}", clock_text(at)), Color::White, 1)?,
        None => display.text((0, 140), "Read: NEVER", Color::Yellow, 1)?,
    }
    if state.last_publish_had_errors {
        display.text((0, 150), "Last Push Had Errors", Color::Red, 1)?;
    } else if let Some(at) = state.last_published_at {
        display.text((0, 150), &format!("Push: {}", clock_text(at)), Color::White, 1)?;
    } else {
        display.text((0, 150), "Push: NEVER", Color::Yellow, 1)?;
    }
    Ok(())
}

/// Title at `y` flanked by a double rule on each side.
fn section_header(display: &mut dyn DisplaySurface, y: i32, rule: u32, title_x: i32, title: &str) -> DrawResult {
    let right = 128 - rule as i32;
    for offset in [5, 10] {
        display.hline((0, y + offset), rule, Color::Gray)?;
        display.hline((right, y + offset), rule, Color::Gray)?;
    }
    display.text((title_x, y), title, Color::White, 2)
}

/// Banner shown instead of running when the developer jumper is fitted.
pub fn show_dev_mode(display: &mut dyn DisplaySurface) -> DrawResult {
    display.fill(Color::Black)?;
    display.text((7, 5), "*DEV MODE*", Color::Yellow, 2)?;
    display.text((7, 25), "Dev jumper active", Color::Yellow, 1)?;
    display.text((7, 35), "In developer mode", Color::Yellow, 1)?;
    display.text((7, 55), "Watchdog disabled", Color::Yellow, 1)?;
    display.text((7, 65), "Auto-run disabled", Color::Yellow, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RomCode, Sensor, WifiIdentity};
    use crate::hal::sim::SimDisplay;
    use chrono::TimeZone;

    fn state() -> DeviceState {
        let mut freezer = Sensor::new(RomCode::new([0x28, 0, 0, 0, 0, 0, 0, 1]), "3");
        freezer.assign("3".to_string(), "Walk In Freezer".to_string(), true);
        freezer.set_temperature(Some(-2.3));
        let spare = Sensor::new(RomCode::new([0x28, 0, 0, 0, 0, 0, 0, 2]), "9");
        DeviceState::new(vec![freezer, spare])
    }

    #[test]
    fn test_wrap_fault_at_twenty() {
        let lines = wrap_fault("Could not initialize sensor(s): B2; check connections");
        assert_eq!(lines[0], "Could not initialize");
        assert!(lines.iter().all(|l| l.chars().count() <= 20));
        assert_eq!(lines.concat(), "Could not initialize sensor(s): B2; check connections");
        assert!(wrap_fault("").is_empty());
    }

    #[test]
    fn test_fault_screen() {
        let display = SimDisplay::new();
        show_fault(&mut display.clone(), "CLOCK SYNC ERROR, will retry");
        let items = display.frame_items();
        assert_eq!(items[0].text, "*EXCEPTION*");
        assert!(items.iter().all(|t| t.color == Color::Red));
        assert_eq!(display.frame()[1..].concat(), "CLOCK SYNC ERROR, will retry");
        assert_eq!(display.background(), Some(Color::Black));
        assert!(display.frame_joined().starts_with("*EXCEPTION*\nCLOCK SYNC ERROR, wi\nll retry"));
    }

    #[test]
    fn test_status_page_before_anything_happened() {
        let display = SimDisplay::new();
        render_status(&mut display.clone(), &state()).unwrap();
        assert!(display.shows("3 Walk In Freezer"));
        assert!(display.shows("-2.30 F"));
        assert!(display.shows("NULL"));
        assert!(display.shows("****DISCONNECTED****"));
        assert!(display.shows("Read: NEVER"));
        assert!(display.shows("Push: NEVER"));
        let spare = display.frame_items().into_iter().find(|t| t.text.starts_with("9 ")).unwrap();
        assert_eq!(spare.color, Color::Yellow);
        // double rule either side of three section titles
        assert_eq!(display.rules_drawn(), 12);
    }

    #[test]
    fn test_status_page_connected_and_published() {
        let mut state = state();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 7, 5, 9).unwrap();
        state.wifi = Some(WifiIdentity { ssid: "shop".to_string(), ip: "10.0.0.7".to_string() });
        state.last_sensed_at = Some(at);
        state.last_published_at = Some(at);
        let display = SimDisplay::new();

        render_status(&mut display.clone(), &state).unwrap();
        assert!(display.shows("SSID: shop"));
        assert!(display.shows("IP: 10.0.0.7"));
        assert!(display.shows("Read: 07:05:09 (UTC)"));
        assert!(display.shows("Push: 07:05:09 (UTC)"));

        state.last_publish_had_errors = true;
        render_status(&mut display.clone(), &state).unwrap();
        assert!(display.shows("Last Push Had Errors"));
        assert!(!display.shows("Push: 07"));
    }

    #[test]
    fn test_render_reports_draw_errors() {
        let display = SimDisplay::new();
        display.set_fail_draw(true);
        assert!(render_status(&mut display.clone(), &state()).is_err());
    }
}
