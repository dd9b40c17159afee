//! String localization helper.
//!
//! The translation service is an external collaborator; record collections
//! only consult it from `t()`.

use std::collections::HashMap;

/// Translation service.
pub trait Translate: Send + Sync {
    /// Returns the translation of `source` in `lang`, or `None` if unknown.
    fn translate(&self, lang: &str, context: &str, source: &str) -> Option<String>;
}

/// In-memory catalog keyed by (lang, context, source).
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: HashMap<(String, String, String), String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        mut self,
        lang: &str,
        context: &str,
        source: &str,
        translation: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            (lang.to_string(), context.to_string(), source.to_string()),
            translation.into(),
        );
        self
    }
}

impl Translate for Catalog {
    fn translate(&self, lang: &str, context: &str, source: &str) -> Option<String> {
        self.entries
            .get(&(lang.to_string(), context.to_string(), source.to_string()))
            .cloned()
    }
}

/// Replaces each `{}` placeholder with the next argument, in order.
///
/// Extra placeholders are kept verbatim; extra arguments are ignored.
pub fn format_placeholders(template: &str, args: &[String]) -> String {
    let mut parts = template.split("{}");
    let mut result = parts.next().unwrap_or_default().to_string();
    let mut args = args.iter();
    for part in parts {
        match args.next() {
            Some(arg) => result.push_str(arg),
            None => result.push_str("{}"),
        }
        result.push_str(part);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::{format_placeholders, Catalog, Translate};

    #[test]
    fn catalog_lookups_are_exact() {
        let catalog = Catalog::new().insert("fr", "", "Hello", "Bonjour");
        assert_eq!(catalog.translate("fr", "", "Hello").as_deref(), Some("Bonjour"));
        assert_eq!(catalog.translate("de", "", "Hello"), None);
    }

    #[test]
    fn placeholders_are_filled_in_order() {
        let args = vec!["3".to_string(), "Acme".to_string()];
        assert_eq!(format_placeholders("{} sales for {}", &args), "3 sales for Acme");
        assert_eq!(format_placeholders("{} and {}", &args[..1]), "3 and {}");
    }
}
