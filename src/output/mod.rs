//! Styled terminal output for the hub state CLI.
//!
//! Everything user-facing goes through here; diagnostics go through `tracing`.

use owo_colors::OwoColorize;

/// Print a success message with a green checkmark
pub fn success(message: &str) {
    // Pastel mint green: RGB(152, 225, 152)
    println!(
        "{} {}",
        "✓".truecolor(152, 225, 152).bold(),
        message.bright_white()
    );
}

/// Print an error message with a red X
pub fn error(message: &str) {
    // Pastel coral/salmon: RGB(255, 160, 160)
    eprintln!(
        "{} {}",
        "✗".truecolor(255, 160, 160).bold(),
        message.bright_white()
    );
}

/// Print a warning message with a yellow warning symbol
pub fn warning(message: &str) {
    // Pastel cream/yellow: RGB(255, 230, 160)
    eprintln!(
        "{} {}",
        "⚠".truecolor(255, 230, 160).bold(),
        message.bright_white()
    );
}

/// Print an info message with a blue info symbol
pub fn info(message: &str) {
    // Pastel sky blue: RGB(160, 200, 255)
    println!(
        "{} {}",
        "ℹ".truecolor(160, 200, 255).bold(),
        message.bright_white()
    );
}

/// Print a section header with a separator line
pub fn section(title: &str) {
    // Pastel lavender: RGB(181, 174, 254)
    println!("\n{}", title.truecolor(181, 174, 254).bold());
    println!("{}", "─".repeat(50).truecolor(160, 160, 160));
}

/// Print a key-value pair with styled key and value
pub fn key_value(key: &str, value: &str) {
    println!(
        "  {} {}",
        format!("{}:", key).truecolor(160, 160, 160),
        value.bright_white()
    );
}

/// Print a dimmed/muted message
pub fn dimmed(message: &str) {
    println!("{}", message.truecolor(160, 160, 160));
}

/// Print a progress indicator
pub fn progress(current: usize, total: usize, item_name: &str) {
    println!(
        "  {} {} {}",
        format!("[{}/{}]", current, total).truecolor(160, 160, 160),
        "Processing".truecolor(160, 160, 160),
        item_name.bright_white()
    );
}

/// Print a summary box with a title and items
pub fn summary_box(title: &str, items: &[(String, String)]) {
    // Softer pastel teal: RGB(120, 180, 195)
    println!("\n{}", title.truecolor(120, 180, 195).bold());
    println!(
        "{}",
        "┌".truecolor(160, 160, 160).to_string()
            + &"─".repeat(48).truecolor(160, 160, 160).to_string()
            + &"┐".truecolor(160, 160, 160).to_string()
    );
    for (key, value) in items {
        let plain_width = key.chars().count() + value.chars().count() + 2;
        let padding = 47_usize.saturating_sub(plain_width);
        println!(
            "{} {}: {}{}{}",
            "│".truecolor(160, 160, 160),
            key.truecolor(160, 160, 160),
            value.bright_white(),
            " ".repeat(padding),
            "│".truecolor(160, 160, 160)
        );
    }
    println!(
        "{}",
        "└".truecolor(160, 160, 160).to_string()
            + &"─".repeat(48).truecolor(160, 160, 160).to_string()
            + &"┘".truecolor(160, 160, 160).to_string()
    );
}

/// Print a blank line for spacing
pub fn blank() {
    println!();
}
