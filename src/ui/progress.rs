use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// 데몬 응답을 기다리는 동안 표시하는 스피너
///
/// stderr가 터미널이 아니면 indicatif가 알아서 그리지 않습니다.
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}
