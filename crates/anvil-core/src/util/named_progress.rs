use indicatif::ProgressStyle;

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a progress bar style with a left-aligned name label.
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let fmt = format!(
            "{:<31} {{wide_bar:40.cyan/blue}} {{pos:>3}}/{{len:<3}} [{{elapsed_precise}} ({{eta}} remaining)] {{msg}}",
            name
        );
        ProgressStyle::default_bar()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_bar())
    }
}
