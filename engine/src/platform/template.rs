//! Download URL templating

use sdk::errors::ResolveError;

use super::PlatformTarget;

/// Substitute `{version}`, `{os}` and `{arch}` in a download URL template
///
/// Substitution is a single left-to-right pass, so substituted values are
/// never themselves expanded. The executable suffix is never added here. It belongs to the cached
/// file name, not to the URL.
///
/// # Errors
///
/// Returns `ResolveError::TemplateExpansion` for an unknown or unterminated
/// placeholder, or when any `{` or `}` survives substitution.
///
/// # Examples
///
/// ```
/// use plughub_engine::platform::{expand, Arch, Os, PlatformTarget};
///
/// let url = expand(
///     "tool",
///     "https://x/v{version}/tool-{os}-{arch}",
///     "2.1.0",
///     PlatformTarget::new(Os::Windows, Arch::Amd64),
/// )
/// .unwrap();
/// assert_eq!(url, "https://x/v2.1.0/tool-windows-amd64");
/// ```
pub fn expand(
    plugin: &str,
    template: &str,
    version: &str,
    target: PlatformTarget,
) -> Result<String, ResolveError> {
    let fail = |reason: String| ResolveError::TemplateExpansion {
        plugin: plugin.to_string(),
        template: template.to_string(),
        reason,
    };

    let mut url = String::with_capacity(template.len() + version.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        url.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| fail("unterminated placeholder".to_string()))?;

        let value = match &after[..close] {
            "version" => version,
            "os" => target.os.as_str(),
            "arch" => target.arch.as_str(),
            other => return Err(fail(format!("unknown placeholder {{{other}}}"))),
        };
        url.push_str(value);
        rest = &after[close + 1..];
    }
    url.push_str(rest);

    if url.contains('{') || url.contains('}') {
        return Err(fail(format!(
            "unsubstituted placeholder syntax remains in {url:?}"
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};
    use proptest::prelude::*;

    const TARGETS: [PlatformTarget; 6] = [
        PlatformTarget::new(Os::Darwin, Arch::Amd64),
        PlatformTarget::new(Os::Darwin, Arch::Arm64),
        PlatformTarget::new(Os::Linux, Arch::Amd64),
        PlatformTarget::new(Os::Linux, Arch::Arm64),
        PlatformTarget::new(Os::Windows, Arch::Amd64),
        PlatformTarget::new(Os::Windows, Arch::Arm64),
    ];

    #[test]
    fn test_expand_all_placeholders() {
        let url = expand(
            "tool",
            "https://x/v{version}/tool-{os}-{arch}",
            "2.1.0",
            PlatformTarget::new(Os::Linux, Arch::Arm64),
        )
        .unwrap();
        assert_eq!(url, "https://x/v2.1.0/tool-linux-arm64");
    }

    #[test]
    fn test_expand_repeated_placeholders() {
        let url = expand(
            "tool",
            "https://x/{version}/{os}/tool-{version}-{os}",
            "1.0",
            PlatformTarget::new(Os::Darwin, Arch::Amd64),
        )
        .unwrap();
        assert_eq!(url, "https://x/1.0/darwin/tool-1.0-darwin");
    }

    #[test]
    fn test_windows_url_has_no_suffix() {
        let url = expand(
            "tool",
            "https://x/tool-{os}",
            "1.0",
            PlatformTarget::new(Os::Windows, Arch::Amd64),
        )
        .unwrap();
        assert!(!url.ends_with(".exe"));
    }

    #[test]
    fn test_leftover_braces_fail() {
        for template in ["https://x/{verison}", "https://x/{version", "https://x/}"] {
            let err = expand(
                "tool",
                template,
                "1.0",
                PlatformTarget::new(Os::Linux, Arch::Amd64),
            )
            .unwrap_err();
            assert!(
                matches!(err, ResolveError::TemplateExpansion { ref plugin, .. } if plugin == "tool"),
                "template {template:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let err = expand(
            "tool",
            "https://x/v{version}/tool-{os}",
            "1.0-{os}",
            PlatformTarget::new(Os::Linux, Arch::Amd64),
        )
        .unwrap_err();

        match err {
            ResolveError::TemplateExpansion { reason, .. } => {
                assert!(reason.contains("1.0-{os}"), "{reason}");
                assert!(!reason.contains("1.0-linux"), "{reason}");
            }
            other => panic!("expected template error, got {other:?}"),
        }
    }

    proptest! {
        // Two distinct targets yield distinct URLs whenever the template
        // mentions the dimension in which they differ.
        #[test]
        fn test_expansion_is_injective_per_platform(
            prefix in "[a-z]{1,8}",
            version in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
            a in 0usize..6,
            b in 0usize..6,
        ) {
            let template = format!("https://x/{prefix}/{{version}}/{prefix}-{{os}}-{{arch}}");
            let (ta, tb) = (TARGETS[a], TARGETS[b]);

            let ua = expand("p", &template, &version, ta).unwrap();
            let ub = expand("p", &template, &version, tb).unwrap();

            prop_assert_eq!(ua == ub, ta == tb);
        }

        #[test]
        fn test_os_only_template_separates_operating_systems(a in 0usize..6, b in 0usize..6) {
            let (ta, tb) = (TARGETS[a], TARGETS[b]);
            let ua = expand("p", "https://x/{os}", "1", ta).unwrap();
            let ub = expand("p", "https://x/{os}", "1", tb).unwrap();

            prop_assert_eq!(ua == ub, ta.os == tb.os);
        }
    }
}
