//! Group message gating.
//!
//! Group messages trigger a reply only when the sender passes the
//! `allow_from` filter and either the channel is always-active or the
//! text mentions the bot (configured patterns plus `@<bot_name>` and the
//! bare name, case-insensitive).

use ag_domain::config::ChannelConfig;

/// Mention patterns for a channel: configured regexes plus the escaped
/// bot name with and without the `@` prefix.
pub fn build_mention_patterns(config: &ChannelConfig) -> Vec<String> {
    let mut patterns = config.mention_patterns.clone();
    if !config.bot_name.is_empty() {
        let escaped = regex::escape(&config.bot_name);
        patterns.push(format!("@{escaped}"));
        patterns.push(escaped);
    }
    patterns
}

/// Whether `text` matches any mention pattern (case-insensitive).
/// Invalid regexes degrade to substring matching.
pub fn check_mentions(text: &str, patterns: &[String]) -> bool {
    if text.is_empty() || patterns.is_empty() {
        return false;
    }
    let text_lower = text.to_lowercase();
    for pattern in patterns {
        if pattern.is_empty() {
            continue;
        }
        match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => {
                if re.is_match(&text_lower) {
                    return true;
                }
            }
            Err(_) => {
                if text_lower.contains(&pattern.to_lowercase()) {
                    return true;
                }
            }
        }
    }
    false
}

/// `allow_from` filter: exact id/name match or `*` wildcard patterns.
/// An unset list means no restriction.
pub fn check_allow_from(
    sender_id: &str,
    sender_name: Option<&str>,
    allow_from: Option<&[String]>,
) -> bool {
    let Some(allow_from) = allow_from else {
        return true;
    };
    if allow_from.is_empty() {
        return true;
    }
    if sender_id.is_empty() {
        return false;
    }

    let sender_id_lower = sender_id.to_lowercase();
    let sender_name_lower = sender_name.map(str::to_lowercase);

    for pattern in allow_from {
        if pattern.is_empty() {
            continue;
        }
        let pattern_lower = pattern.to_lowercase();
        if pattern_lower == sender_id_lower
            || sender_name_lower.as_deref() == Some(pattern_lower.as_str())
        {
            return true;
        }
        if pattern.contains('*') {
            let regex_pattern = format!(
                "^{}$",
                regex::escape(pattern).replace("\\*", ".*")
            );
            if let Ok(re) = regex::RegexBuilder::new(&regex_pattern)
                .case_insensitive(true)
                .build()
            {
                if re.is_match(sender_id)
                    || sender_name.is_some_and(|name| re.is_match(name))
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Full group-gating decision for one group message.
pub fn group_message_triggers(
    config: &ChannelConfig,
    text: &str,
    sender_id: &str,
    sender_name: Option<&str>,
) -> bool {
    if !check_allow_from(sender_id, sender_name, config.allow_from.as_deref()) {
        return false;
    }
    if config.always_group_activation {
        return true;
    }
    check_mentions(text, &build_mention_patterns(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bot_name: &str) -> ChannelConfig {
        ChannelConfig { bot_name: bot_name.into(), ..Default::default() }
    }

    #[test]
    fn plain_text_without_mention_is_dropped() {
        assert!(!group_message_triggers(&config("clawd"), "hello", "u1", None));
    }

    #[test]
    fn at_mention_triggers() {
        assert!(group_message_triggers(&config("clawd"), "@clawd hello", "u1", None));
    }

    #[test]
    fn bare_name_triggers_case_insensitive() {
        assert!(group_message_triggers(&config("clawd"), "hey CLAWD, ping", "u1", None));
    }

    #[test]
    fn always_activation_skips_mentions() {
        let mut config = config("clawd");
        config.always_group_activation = true;
        assert!(group_message_triggers(&config, "no mention here", "u1", None));
    }

    #[test]
    fn allow_from_blocks_unlisted_sender() {
        let mut config = config("clawd");
        config.allow_from = Some(vec!["alice".into()]);
        assert!(!group_message_triggers(&config, "@clawd hi", "bob", None));
        assert!(group_message_triggers(&config, "@clawd hi", "alice", None));
    }

    #[test]
    fn allow_from_matches_display_name() {
        let mut config = config("clawd");
        config.allow_from = Some(vec!["Alice Smith".into()]);
        assert!(group_message_triggers(&config, "@clawd hi", "u771", Some("Alice Smith")));
    }

    #[test]
    fn allow_from_wildcard_patterns() {
        assert!(check_allow_from("telegram:12345", None, Some(&["telegram:*".to_string()])));
        assert!(!check_allow_from("discord:9", None, Some(&["telegram:*".to_string()])));
    }

    #[test]
    fn bot_name_with_regex_chars_is_escaped() {
        let config = config("c++bot");
        assert!(group_message_triggers(&config, "ping @c++bot", "u1", None));
    }

    #[test]
    fn invalid_configured_pattern_falls_back_to_substring() {
        let mut config = config("");
        config.mention_patterns = vec!["[unclosed".into()];
        assert!(check_mentions("this has [unclosed bracket", &build_mention_patterns(&config)));
    }
}
