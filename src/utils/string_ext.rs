//! String extension helpers shared by the schema and serializer modules.

/// Trim-and-clean extension trait.
pub trait StringExt {
    /// Trim and return `None` if the result is empty.
    fn clean(&self) -> Option<String>;

    /// Trim, returning an empty string rather than `None`.
    fn trimmed(&self) -> String;
}

impl StringExt for str {
    #[inline]
    fn clean(&self) -> Option<String> {
        let trimmed = self.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    }

    #[inline]
    fn trimmed(&self) -> String {
        self.trim().to_string()
    }
}

impl StringExt for String {
    #[inline]
    fn clean(&self) -> Option<String> {
        self.as_str().clean()
    }

    #[inline]
    fn trimmed(&self) -> String {
        self.as_str().trimmed()
    }
}

impl<T: AsRef<str>> StringExt for Option<T> {
    #[inline]
    fn clean(&self) -> Option<String> {
        self.as_ref().and_then(|s| s.as_ref().clean())
    }

    #[inline]
    fn trimmed(&self) -> String {
        self.as_ref().map(|s| s.as_ref().trim().to_string()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_ext_clean_and_trimmed() {
        assert_eq!("  ".clean(), None);
        assert_eq!("  x  ".clean(), Some("x".to_string()));
        assert_eq!("  x  ".trimmed(), "x".to_string());
    }

    #[test]
    fn option_ext_trimmed_defaults_to_empty() {
        let none: Option<String> = None;
        assert_eq!(none.trimmed(), "");
    }
}
