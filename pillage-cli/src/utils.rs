//! Status output. Everything goes to stderr so stdout stays a JSON document.

use console::style;

pub fn print_success(message: &str) {
    eprintln!("{} {}", style("✅").green(), style(message).green());
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", style("❌").red(), style(message).red());
}

pub fn print_info(message: &str) {
    eprintln!("{} {}", style("ℹ️").blue(), style(message).blue());
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", style("⚠️").yellow(), style(message).yellow());
}

pub fn print_separator() {
    eprintln!("{}", style("─".repeat(60)).dim());
}

pub fn print_header(title: &str) {
    eprintln!();
    print_separator();
    eprintln!("{}", style(title).bold().cyan());
    print_separator();
}
