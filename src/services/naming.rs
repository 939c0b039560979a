//! Physical naming for stored objects.
//!
//! Every object lives in one flat directory under the name
//! `<key>_<timestamp>_<display name>`. The key never contains the separator,
//! so the text before the first `_` always recovers it, and the
//! `<key>_` prefix selects exactly the objects belonging to one slot.

/// Separator between the key, the timestamp and the display name.
pub const SEPARATOR: char = '_';

const MAX_KEY_LEN: usize = 128;
const MAX_DISPLAY_NAME_LEN: usize = 128;
const FALLBACK_DISPLAY_NAME: &str = "upload";
/// Longest file name common filesystems (ext4, xfs, btrfs, APFS) accept.
pub const MAX_PHYSICAL_NAME_LEN: usize = 255;
/// Extensions up to this length survive truncation of a long display name.
const MAX_KEPT_EXTENSION_LEN: usize = 16;

/// A physical name split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName<'a> {
    pub key: &'a str,
    pub timestamp: i64,
    pub display_name: &'a str,
}

/// Validate a caller-supplied key, returning the reason it was rejected.
pub fn check_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key must not be empty");
    }
    if key.len() > MAX_KEY_LEN {
        return Err("key is longer than 128 bytes");
    }
    if key.contains(SEPARATOR) {
        return Err("key must not contain `_`");
    }
    if key.starts_with('.') {
        return Err("key must not start with `.`");
    }
    if key.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err("key contains a path separator or control character");
    }
    Ok(())
}

/// Reduce a client-provided filename to something safe to embed in a
/// physical name: last path component only, no control characters.
pub fn sanitize_display_name(original: &str) -> String {
    let last = original
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    let mut cleaned = String::with_capacity(last.len());
    for c in last.chars() {
        if cleaned.len() + c.len_utf8() > MAX_DISPLAY_NAME_LEN {
            break;
        }
        cleaned.push(if c.is_control() { '-' } else { c });
    }

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_DISPLAY_NAME.to_string()
    } else {
        cleaned
    }
}

/// Build the physical name for one upload. The key must already have passed
/// [`check_key`] and the display name [`sanitize_display_name`].
///
/// The display name is shortened (keeping its extension) so the whole name
/// stays within [`MAX_PHYSICAL_NAME_LEN`] bytes.
pub fn name_for(key: &str, timestamp: i64, display_name: &str) -> String {
    let prefix = format!("{key}{SEPARATOR}{timestamp}{SEPARATOR}");
    let budget = MAX_PHYSICAL_NAME_LEN.saturating_sub(prefix.len());
    format!("{prefix}{}", fit_display_name(display_name, budget))
}

/// Shorten `display_name` to at most `budget` bytes on a char boundary,
/// keeping a short extension intact.
fn fit_display_name(display_name: &str, budget: usize) -> String {
    if display_name.len() <= budget {
        return display_name.to_string();
    }

    let (stem, extension) = match display_name.rfind('.') {
        Some(dot)
            if dot > 0
                && display_name.len() - dot <= MAX_KEPT_EXTENSION_LEN
                && display_name.len() - dot < budget =>
        {
            display_name.split_at(dot)
        }
        _ => (display_name, ""),
    };

    let mut end = budget - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{extension}", &stem[..end])
}

/// Split a physical name. Hidden entries and names that do not follow the
/// layout yield `None`.
pub fn parse(physical_name: &str) -> Option<ParsedName<'_>> {
    if physical_name.starts_with('.') {
        return None;
    }
    let (key, rest) = physical_name.split_once(SEPARATOR)?;
    let (timestamp, display_name) = rest.split_once(SEPARATOR)?;
    if key.is_empty() || timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some(ParsedName {
        key,
        timestamp: timestamp.parse().ok()?,
        display_name,
    })
}

/// The logical key an object belongs to.
pub fn key_of(physical_name: &str) -> Option<&str> {
    parse(physical_name).map(|parsed| parsed.key)
}

/// Whether `physical_name` holds an object for `key`.
pub fn belongs_to(physical_name: &str, key: &str) -> bool {
    key_of(physical_name) == Some(key)
}

/// Find the current object for `key` in a directory listing.
///
/// Outside of a concurrent write or a crash, at most one name matches. When
/// several do, the newest timestamp is returned.
pub fn resolve<'a, I>(key: &str, listing: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    listing
        .into_iter()
        .filter_map(|name| parse(name).map(|parsed| (parsed, name)))
        .filter(|(parsed, _)| parsed.key == key)
        .max_by_key(|(parsed, _)| parsed.timestamp)
        .map(|(_, name)| name)
}

/// Media type served for an object, derived from its display name.
pub fn content_type_for(physical_name: &str) -> &'static str {
    let display = parse(physical_name)
        .map(|parsed| parsed.display_name)
        .unwrap_or(physical_name);
    let extension = display
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "avif" => "image/avif",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}
