mod board;
#[cfg(feature = "esp32")]
mod esp;
mod form;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(not(feature = "esp32"))]
fn main() -> anyhow::Result<()> {
    host::run()
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}

/// Accepts `1`, `true`, `yes` and `on`, case-insensitively.
pub(crate) fn flag_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
