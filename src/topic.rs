use crate::error::{GatewayError, Result};

const MAX_TOPIC_BYTES: usize = 65_535;

/// Checks an MQTT subscription filter (`+` single level, `#` trailing multi level).
pub fn validate_filter(filter: &str) -> Result<()> {
    check_common(filter)?;
    let levels = filter.split('/').collect::<Vec<_>>();
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || idx + 1 != levels.len()) {
            return Err(invalid(filter, "'#' must be the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid(filter, "'+' must occupy a whole level"));
        }
    }
    Ok(())
}

pub fn validate_publish_topic(topic: &str) -> Result<()> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(invalid(topic, "wildcards are not allowed when publishing"));
    }
    Ok(())
}

pub fn is_wildcard(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

pub fn matches(filter: &str, topic: &str) -> bool {
    capture(filter, topic).is_some()
}

/// Matches `topic` against `filter` and returns the levels consumed by each
/// `+` wildcard, in order. `#` captures nothing.
pub fn capture<'t>(filter: &str, topic: &'t str) -> Option<Vec<&'t str>> {
    // Wildcards at the first level never match $SYS style topics.
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return None;
    }

    let mut captured = Vec::new();
    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        match filter_level {
            "#" => return Some(captured),
            "+" => captured.push(topic_levels.next()?),
            exact => {
                if topic_levels.next()? != exact {
                    return None;
                }
            }
        }
    }
    topic_levels.next().is_none().then_some(captured)
}

fn check_common(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(invalid(topic, "must not be empty"));
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(invalid(topic, "longer than 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(invalid(topic, "contains a NUL character"));
    }
    Ok(())
}

fn invalid(topic: &str, reason: &'static str) -> GatewayError {
    GatewayError::InvalidTopic {
        topic: topic.to_owned(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::{capture, matches, validate_filter, validate_publish_topic};

    #[test]
    fn exact_filters_match_only_identical_topics() {
        assert!(matches("hermes/asr/textCaptured", "hermes/asr/textCaptured"));
        assert!(!matches("hermes/asr/textCaptured", "hermes/asr/textCaptured/x"));
        assert!(!matches("hermes/asr", "hermes/asr/textCaptured"));
    }

    #[test]
    fn single_level_wildcard_captures_segment() {
        assert_eq!(
            capture("hermes/hotword/+/detected", "hermes/hotword/porcupine/detected"),
            Some(vec!["porcupine"])
        );
        assert_eq!(capture("hermes/hotword/+/detected", "hermes/hotword/detected"), None);
        assert!(matches("a/+/c", "a//c"));
    }

    #[test]
    fn multi_level_wildcard_matches_parent_and_children() {
        assert!(matches("hermes/intent/#", "hermes/intent/ChangeLightState"));
        assert!(matches("hermes/intent/#", "hermes/intent/a/b"));
        assert!(matches("hermes/intent/#", "hermes/intent"));
        assert!(!matches("hermes/intent/#", "hermes/nlu/query"));
        assert!(matches("#", "anything/at/all"));
    }

    #[test]
    fn leading_wildcards_skip_dollar_topics() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn filter_validation_rejects_misplaced_wildcards() {
        assert!(validate_filter("hermes/#").is_ok());
        assert!(validate_filter("+/x/+").is_ok());
        assert!(validate_filter("hermes/#/x").is_err());
        assert!(validate_filter("hermes/in#").is_err());
        assert!(validate_filter("hermes/a+").is_err());
        assert!(validate_filter("").is_err());
    }

    #[test]
    fn publish_topics_reject_wildcards() {
        assert!(validate_publish_topic("hermes/asr/textCaptured").is_ok());
        assert!(validate_publish_topic("hermes/+/x").is_err());
        assert!(validate_publish_topic("hermes/#").is_err());
    }
}
