/// Strategy producing a replacement save name after a collision.
///
/// `base` is the save name without its extension; the batch reattaches the
/// extension to whatever this returns. `attempt` starts at 1 and increases by
/// one on every retry.
///
/// Implementations must yield infinitely many distinct names as `attempt`
/// grows (including the counter in the output is enough). A resolver with a
/// finite range can never settle a crowded name; the batch stops after its
/// configured attempt ceiling and reports
/// [`UploadError::NameResolutionExhausted`](crate::UploadError::NameResolutionExhausted).
pub trait NameResolver: Send + Sync {
    fn resolve(&self, base: &str, attempt: u32) -> String;
}

impl<F> NameResolver for F
where
    F: Fn(&str, u32) -> String + Send + Sync,
{
    fn resolve(&self, base: &str, attempt: u32) -> String {
        self(base, attempt)
    }
}

/// Default resolver: `"{base} ({attempt})"`, the way Windows Explorer names copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsStyleResolver;

impl NameResolver for WindowsStyleResolver {
    fn resolve(&self, base: &str, attempt: u32) -> String {
        format!("{} ({})", base, attempt)
    }
}

/// Split a file name into `(stem, extension)`. The extension starts at the last
/// `.` of the final path segment and keeps the dot; it is empty when there is none.
pub fn split_extension(name: &str) -> (&str, &str) {
    let segment_start = name.rfind(&['/', '\\'][..]).map_or(0, |i| i + 1);
    match name[segment_start..].rfind('.') {
        Some(dot) => name.split_at(segment_start + dot),
        None => (name, ""),
    }
}

/// Extension of a file name, including the leading dot.
pub fn extension_of(name: &str) -> &str {
    split_extension(name).1
}

/// Run the resolver around the stem of `name` and put the extension back.
pub(crate) fn resolve_with_extension(
    resolver: &dyn NameResolver,
    name: &str,
    attempt: u32,
) -> String {
    let (stem, ext) = split_extension(name);
    format!("{}{}", resolver.resolve(stem, attempt), ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_style() {
        assert_eq!(WindowsStyleResolver.resolve("a", 1), "a (1)");
        assert_eq!(WindowsStyleResolver.resolve("report final", 12), "report final (12)");
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |base: &str, attempt: u32| format!("{}_{}", base, attempt);
        assert_eq!(resolver.resolve("photo", 3), "photo_3");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.txt"), ("a", ".txt"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".env"), ("", ".env"));
        assert_eq!(split_extension("dir.v2/file"), ("dir.v2/file", ""));
        assert_eq!(split_extension("C:\\tmp.d\\img.png"), ("C:\\tmp.d\\img", ".png"));
    }

    #[test]
    fn test_resolve_keeps_extension() {
        assert_eq!(resolve_with_extension(&WindowsStyleResolver, "a.txt", 2), "a (2).txt");
        assert_eq!(resolve_with_extension(&WindowsStyleResolver, "notes", 1), "notes (1)");
    }
}
