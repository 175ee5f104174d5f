//! Locale resolution
//!
//! Picks the best supported tag for an ordered list of requested locales.
//! Used both to select which model archive to download and, by the
//! surrounding system, which command-pattern set to load.

use std::fmt;

use crate::{Error, Result};

/// A `language[-region]` locale tag. All comparisons are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    language: String,
    region: Option<String>,
}

impl Locale {
    /// Create a locale from a language and an optional region
    #[must_use]
    pub fn new(language: impl Into<String>, region: Option<&str>) -> Self {
        Self {
            language: language.into(),
            region: region.map(ToString::to_string),
        }
    }

    /// Parse a `language[-region]` tag; `_` is accepted as a separator too
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let mut parts = tag.trim().splitn(2, ['-', '_']);
        let language = parts.next().unwrap_or_default().to_string();
        let region = parts.next().filter(|r| !r.is_empty()).map(ToString::to_string);
        Self { language, region }
    }

    /// Base language subtag
    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Region subtag, if any
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}-{region}", self.language),
            None => write!(f, "{}", self.language),
        }
    }
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleResolutionResult {
    /// The requested locale that resolved
    pub resolved: Locale,
    /// The supported tag it resolved to, as listed in the supported set
    pub supported_tag: String,
}

/// Resolve the best supported tag for an ordered list of requested locales.
///
/// Requested locales are tried in order; the first one that resolves wins.
/// If none resolves, the failure reported is the one recorded for the
/// *first* requested locale, so error reporting is deterministic.
///
/// # Errors
///
/// Returns [`Error::UnsupportedLocale`] when no requested locale resolves,
/// or when `requested` is empty.
pub fn resolve_supported_locale(
    requested: &[Locale],
    supported: &[&str],
) -> Result<LocaleResolutionResult> {
    let mut first_failure = None;

    for locale in requested {
        match resolve_locale_tag(locale, supported) {
            Ok(supported_tag) => {
                return Ok(LocaleResolutionResult {
                    resolved: locale.clone(),
                    supported_tag,
                });
            }
            Err(e) => {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }

    Err(first_failure
        .unwrap_or_else(|| Error::UnsupportedLocale("no locales requested".to_string())))
}

/// Resolve a single locale against the supported tags.
///
/// Three steps, first match wins:
/// 1. exact `language-region` tag match,
/// 2. base-language-only match,
/// 3. compound tags joining alternatives with `+` — the requested base
///    language is matched against the base of each alternative and the
///    *whole* compound tag is returned, so one supported entry can serve
///    several related dialects.
///
/// # Errors
///
/// Returns [`Error::UnsupportedLocale`] when none of the steps match.
pub fn resolve_locale_tag(locale: &Locale, supported: &[&str]) -> Result<String> {
    let language = locale.language().to_lowercase();

    if let Some(region) = locale.region() {
        let full = format!("{language}-{}", region.to_lowercase());
        if let Some(tag) = supported.iter().find(|t| t.to_lowercase() == full) {
            return Ok((*tag).to_string());
        }
    }

    if let Some(tag) = supported.iter().find(|t| t.to_lowercase() == language) {
        return Ok((*tag).to_string());
    }

    for tag in supported {
        for alternative in tag.split('+') {
            let base = alternative.split('-').next().unwrap_or(alternative);
            if base.to_lowercase() == language {
                return Ok((*tag).to_string());
            }
        }
    }

    Err(Error::UnsupportedLocale(locale.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_tag() {
        let locale = Locale::parse("en-US");
        assert_eq!(locale.language(), "en");
        assert_eq!(locale.region(), Some("US"));
    }

    #[test]
    fn parse_base_language_only() {
        let locale = Locale::parse("fr");
        assert_eq!(locale.language(), "fr");
        assert_eq!(locale.region(), None);
    }

    #[test]
    fn parse_underscore_separator_and_whitespace() {
        let locale = Locale::parse(" en_GB ");
        assert_eq!(locale.language(), "en");
        assert_eq!(locale.region(), Some("GB"));
    }

    #[test]
    fn exact_tag_match() {
        let result =
            resolve_supported_locale(&[Locale::parse("en-IN")], &["en", "en-in", "fr"]).unwrap();
        assert_eq!(result.supported_tag, "en-in");
    }

    #[test]
    fn base_language_fallback() {
        let result = resolve_supported_locale(&[Locale::parse(" en-US")], &["en"]).unwrap();
        assert_eq!(result.supported_tag, "en");
        assert_eq!(result.resolved.language(), "en");
    }

    #[test]
    fn compound_tag_returns_whole_entry() {
        let result =
            resolve_supported_locale(&[Locale::parse("pt-BR")], &["en", "pt-pt+pt-br"]).unwrap();
        assert_eq!(result.supported_tag, "pt-pt+pt-br");
    }

    #[test]
    fn compound_tag_matches_on_base_language() {
        let result =
            resolve_supported_locale(&[Locale::parse("en-AU")], &["fr", "en-us+en-gb"]).unwrap();
        assert_eq!(result.supported_tag, "en-us+en-gb");
    }

    #[test]
    fn requested_order_wins() {
        let result = resolve_supported_locale(
            &[Locale::parse("fr-FR"), Locale::parse("en-US")],
            &["en", "fr"],
        )
        .unwrap();
        assert_eq!(result.supported_tag, "fr");
    }

    #[test]
    fn case_insensitive_matching() {
        let result = resolve_supported_locale(&[Locale::parse("EN-us")], &["En-US"]).unwrap();
        assert_eq!(result.supported_tag, "En-US");
    }

    #[test]
    fn unsupported_locale_fails() {
        let err = resolve_supported_locale(&[Locale::parse("xx-YY")], &["en", "fr"]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLocale(_)));
    }

    #[test]
    fn first_failure_is_reported() {
        let err = resolve_supported_locale(
            &[Locale::parse("xx-YY"), Locale::parse("zz")],
            &["en"],
        )
        .unwrap_err();
        match err {
            Error::UnsupportedLocale(tag) => assert_eq!(tag, "xx-YY"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_request_fails() {
        let err = resolve_supported_locale(&[], &["en"]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLocale(_)));
    }
}
