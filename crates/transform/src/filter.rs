use tgrelay_config::{FilterConfig, FilterMode};

/// Keyword filter decision for a message's text (or album caption).
///
/// Text-less messages pass only in blacklist mode; an empty keyword list
/// lets everything through.
#[must_use]
pub fn should_forward(text: Option<&str>, filter: &FilterConfig) -> bool {
    if !filter.enabled {
        return true;
    }
    let Some(text) = text.filter(|t| !t.is_empty()) else {
        return filter.mode == FilterMode::Blacklist;
    };
    if filter.keywords.is_empty() {
        return true;
    }

    let haystack = text.to_lowercase();
    let hit = filter
        .keywords
        .iter()
        .any(|k| haystack.contains(&k.to_lowercase()));

    match filter.mode {
        FilterMode::Whitelist => hit,
        FilterMode::Blacklist => !hit,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn filter(enabled: bool, mode: FilterMode, keywords: &[&str]) -> FilterConfig {
        FilterConfig {
            enabled,
            mode,
            keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
        }
    }

    #[rstest]
    #[case(Some("BUY GOLD now"), FilterMode::Whitelist, &["gold"], true)]
    #[case(Some("BUY GOLD now"), FilterMode::Blacklist, &["gold"], false)]
    #[case(Some("silver only"), FilterMode::Whitelist, &["gold"], false)]
    #[case(Some("silver only"), FilterMode::Blacklist, &["gold"], true)]
    #[case(Some("anything"), FilterMode::Whitelist, &[], true)]
    #[case(None, FilterMode::Whitelist, &["gold"], false)]
    #[case(Some(""), FilterMode::Whitelist, &["gold"], false)]
    #[case(None, FilterMode::Blacklist, &["gold"], true)]
    #[case(Some("Goldman"), FilterMode::Whitelist, &["GOLD"], true)]
    fn decides(
        #[case] text: Option<&str>,
        #[case] mode: FilterMode,
        #[case] keywords: &[&str],
        #[case] expected: bool,
    ) {
        assert_eq!(should_forward(text, &filter(true, mode, keywords)), expected);
    }

    #[test]
    fn disabled_forwards_everything() {
        let f = filter(false, FilterMode::Whitelist, &["gold"]);
        assert!(should_forward(None, &f));
        assert!(should_forward(Some("silver"), &f));
    }
}
