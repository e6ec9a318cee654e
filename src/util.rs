use chrono::Local;

/// Backup timestamp shared by every file in one batch.
/// Format sorts correctly as a plain string: YYYYMMDD_HHMMSS
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Replace illegal Windows filename characters
pub fn sanitize_filename(name: &str) -> String {
    let illegal = ['<', '>', '/', '\\', '|', '?', '*', ':', '"'];
    name.chars()
        .map(|c| if illegal.contains(&c) { '_' } else { c })
        .collect()
}

/// Derive an operator-facing name from a task directory name:
/// underscores become spaces, each word is title-cased.
pub fn display_name(dir_name: &str) -> String {
    dir_name
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
