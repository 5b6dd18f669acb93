/// Validate a topic filter (used in SUBSCRIBE)
pub fn validate_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let filter = match filter.strip_prefix("$share/") {
        Some(_) => strip_share(filter).ok_or("invalid shared subscription format")?,
        None => filter,
    };

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// `$share/{group}/{filter}` -> `{filter}`
pub fn strip_share(filter: &str) -> Option<&str> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, actual) = rest.split_once('/')?;
    if group.is_empty() || actual.is_empty() {
        return None;
    }
    Some(actual)
}

/// Check if a topic filter matches a topic name
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter = strip_share(filter).unwrap_or(filter);

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a/#/c" ; "hash not last")]
    #[test_case("a/b#" ; "hash not bounded")]
    #[test_case("a/b+" ; "plus not bounded")]
    #[test_case("a/+b/c" ; "plus prefix")]
    #[test_case("" ; "empty")]
    #[test_case("$share//a" ; "empty group")]
    #[test_case("$share/g" ; "no filter")]
    fn test_invalid_filters(filter: &str) {
        assert!(validate_filter(filter).is_err());
    }

    #[test_case("#" ; "bare hash")]
    #[test_case("+" ; "bare plus")]
    #[test_case("a/+/c" ; "inner plus")]
    #[test_case("a/#" ; "trailing hash")]
    #[test_case("$SYS/broker/version" ; "system topic")]
    #[test_case("$share/g/a/+" ; "shared")]
    fn test_valid_filters(filter: &str) {
        assert!(validate_filter(filter).is_ok());
    }

    #[test_case("a/+/c", "a/b/c" => true ; "plus matches one level")]
    #[test_case("a/+/c", "a/b/d" => false ; "plus last level differs")]
    #[test_case("a/+/c", "a/c" => false ; "plus needs a level")]
    #[test_case("a/#", "a" => true ; "hash matches parent")]
    #[test_case("a/#", "a/b/c" => true ; "hash matches deep")]
    #[test_case("a/#", "a/d" => true ; "hash matches shallow")]
    #[test_case("a/b", "a/b/c" => false ; "exact is exact")]
    #[test_case("#", "$SYS/broker/uptime" => false ; "hash skips system")]
    #[test_case("+/broker/uptime", "$SYS/broker/uptime" => false ; "plus skips system")]
    #[test_case("$SYS/#", "$SYS/broker/uptime" => true ; "explicit system")]
    #[test_case("$share/g/a/+", "a/b" => true ; "shared strips group")]
    fn test_matches(filter: &str, topic: &str) -> bool {
        matches(filter, topic)
    }
}
