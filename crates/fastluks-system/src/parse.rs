//! Helpers for reading host files the probes depend on.

/// Read a `KEY=value` entry from os-release formatted text. Quotes around the
/// value are stripped.
pub(crate) fn os_release_value<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let (name, value) = line.split_once('=')?;
        if name.trim() != key {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then_some(value)
    })
}

/// Lower-case distribution identifier from os-release text.
pub(crate) fn distro_id(contents: &str) -> Option<String> {
    os_release_value(contents, "ID").map(str::to_ascii_lowercase)
}
