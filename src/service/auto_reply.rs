//! Keyword auto-reply matching
//!
//! Rules are evaluated in priority order (priority descending, id
//! ascending) and the first match wins, so a high-priority broad rule
//! beats a lower-priority specific one. All text matching is
//! case-insensitive.

use regex::RegexBuilder;

use crate::data::{AutoReplyRule, MatchType};

/// Find the first rule matching the given inbound text.
///
/// Rules must already be in evaluation order, as returned by the rule
/// query. A rule with an unknown match type or an uncompilable regex
/// is skipped, never fatal. No match is a normal outcome.
pub fn find_matching_rule<'a>(rules: &'a [AutoReplyRule], text: &str) -> Option<&'a AutoReplyRule> {
    rules.iter().find(|rule| rule_matches(rule, text))
}

fn rule_matches(rule: &AutoReplyRule, text: &str) -> bool {
    let Some(match_type) = MatchType::parse(&rule.match_type) else {
        tracing::warn!(rule_id = %rule.id, match_type = %rule.match_type, "Unknown match type, skipping rule");
        return false;
    };

    match match_type {
        MatchType::Exact => text.to_lowercase() == rule.keyword.to_lowercase(),
        MatchType::Contains => text.to_lowercase().contains(&rule.keyword.to_lowercase()),
        MatchType::StartsWith => text.to_lowercase().starts_with(&rule.keyword.to_lowercase()),
        MatchType::Regex => match RegexBuilder::new(&rule.keyword).case_insensitive(true).build() {
            Ok(re) => re.is_match(text),
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, error = %e, "Rule regex failed to compile, skipping");
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(id: &str, keyword: &str, match_type: &str, priority: i64) -> AutoReplyRule {
        AutoReplyRule {
            id: id.to_string(),
            account_id: "acct".to_string(),
            channel_id: None,
            keyword: keyword.to_string(),
            match_type: match_type.to_string(),
            reply_content: format!("reply for {keyword}"),
            is_active: true,
            priority,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let rules = vec![rule("a", "Hours", "exact", 0)];
        assert!(find_matching_rule(&rules, "hours").is_some());
        assert!(find_matching_rule(&rules, "HOURS").is_some());
        assert!(find_matching_rule(&rules, "opening hours").is_none());
    }

    #[test]
    fn contains_and_starts_with() {
        let rules = vec![rule("a", "price", "contains", 0)];
        assert!(find_matching_rule(&rules, "What is the PRICE of this?").is_some());

        let rules = vec![rule("a", "hello", "starts_with", 0)];
        assert!(find_matching_rule(&rules, "Hello there").is_some());
        assert!(find_matching_rule(&rules, "oh hello").is_none());
    }

    #[test]
    fn regex_match_and_bad_pattern_skipped() {
        let rules = vec![
            rule("a", "[invalid", "regex", 10),
            rule("b", r"order\s+#\d+", "regex", 5),
        ];
        let matched = find_matching_rule(&rules, "Order  #12345 status").unwrap();
        assert_eq!(matched.id, "b");
    }

    #[test]
    fn first_match_in_priority_order_wins() {
        // Caller supplies rules already ordered priority DESC: the
        // broad contains rule at priority 10 beats the exact rule at 5
        // even though the exact rule is more specific.
        let rules = vec![
            rule("broad", "price", "contains", 10),
            rule("specific", "pricing", "exact", 5),
        ];
        let matched = find_matching_rule(&rules, "pricing").unwrap();
        assert_eq!(matched.id, "broad");
    }

    #[test]
    fn no_match_is_none() {
        let rules = vec![rule("a", "refund", "exact", 0)];
        assert!(find_matching_rule(&rules, "hello").is_none());
        assert!(find_matching_rule(&[], "anything").is_none());
    }
}
