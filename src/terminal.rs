use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{}{}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{}{}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{}{}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{}{}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_banner(version: &str) {
    println!();
    println!(
        "{}{} {}",
        SPARKLE,
        style("ferry").cyan().bold(),
        style(version).dim()
    );
    println!(
        "   {}",
        style("bridging your chat channel to assistant sessions").dim()
    );
    println!();
}

pub fn print_goodbye() {
    println!("{}", style("Goodbye!").dim());
}
