//! Lock key helpers

/// Separator placed between the prefix and every key segment
pub const KEY_DELIMITER: &str = ":";

/// Join an optional prefix and the key segments into one storage key.
///
/// An absent or empty prefix is omitted rather than producing a leading
/// delimiter.
///
/// # Examples
///
/// ```
/// use warden_common::join_key;
///
/// assert_eq!(join_key(Some("app"), &["report", "tenant-42"]), "app:report:tenant-42");
/// assert_eq!(join_key(None, &["report"]), "report");
/// ```
pub fn join_key<S: AsRef<str>>(prefix: Option<&str>, segments: &[S]) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(segments.len() + 1);
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        parts.push(prefix);
    }
    parts.extend(segments.iter().map(|s| AsRef::<str>::as_ref(s)));
    parts.join(KEY_DELIMITER)
}
