//! Shared macros for the backend crate.

/// Implement `fmt::Debug` for a struct, hiding the fields marked as secret.
///
/// Each field is prefixed with how it should be rendered:
///
/// - `show field` prints the value
/// - `redact field` prints `"[REDACTED]"`
/// - `redact_option field` prints `Some("[REDACTED]")` or `None`
///
/// ```ignore
/// redacted_debug!(Credentials {
///     show username,
///     redact password,
/// });
/// ```
macro_rules! redacted_debug {
    ($name:ident { $( $kind:ident $field:ident ),* $(,)? }) => {
        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let mut out = f.debug_struct(stringify!($name));
                $( redacted_debug!(@field out, self, $kind, $field); )*
                out.finish_non_exhaustive()
            }
        }
    };
    (@field $out:ident, $self:ident, show, $field:ident) => {
        $out.field(stringify!($field), &$self.$field);
    };
    (@field $out:ident, $self:ident, redact, $field:ident) => {
        $out.field(stringify!($field), &"[REDACTED]");
    };
    (@field $out:ident, $self:ident, redact_option, $field:ident) => {
        $out.field(stringify!($field), &$self.$field.as_ref().map(|_| "[REDACTED]"));
    };
}

#[cfg(test)]
mod tests {
    #[allow(dead_code)]
    struct BasicAuth {
        user: String,
        token: String,
        fallback_token: Option<String>,
    }

    redacted_debug!(BasicAuth {
        show user,
        redact token,
        redact_option fallback_token,
    });

    #[test]
    fn test_redacted_debug_keeps_secrets_out() {
        let auth = BasicAuth {
            user: "sync-bot".to_string(),
            token: "hunter2".to_string(),
            fallback_token: Some("hunter3".to_string()),
        };
        let rendered = format!("{:?}", auth);
        assert!(rendered.contains("sync-bot"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("hunter3"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_redacted_debug_shows_missing_option_as_none() {
        let auth = BasicAuth {
            user: "sync-bot".to_string(),
            token: "hunter2".to_string(),
            fallback_token: None,
        };
        let rendered = format!("{:?}", auth);
        assert!(rendered.contains("None"));
    }
}
