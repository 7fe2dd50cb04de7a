/// Evaluates a concrete topic against a filter using broker wildcard rules.
///
/// `#` matches every remaining level, including zero. `+` matches exactly one
/// level. Leading and trailing separators are insignificant on both sides.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_segments: Vec<&str> = filter.split('/').filter(|s| !s.is_empty()).collect();
    let topic_segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();

    for (index, segment) in filter_segments.iter().enumerate() {
        match *segment {
            "#" => return true,
            "+" => {
                if topic_segments.get(index).is_none() {
                    return false;
                }
            }
            literal => {
                if topic_segments.get(index) != Some(&literal) {
                    return false;
                }
            }
        }
    }

    filter_segments.len() == topic_segments.len()
}
