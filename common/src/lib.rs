pub mod cli;
pub mod metrics;
pub mod shutdown;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const CREATED_BY: &str = "hibernator.io/created-by";
    pub const TRIGGERED_BY: &str = "hibernator.io/triggered-by";
    pub const SUSPEND_UNTIL: &str = "hibernator.io/suspend-until";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
