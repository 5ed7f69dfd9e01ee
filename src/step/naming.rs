/// Guesses a short id from a step name.
///
/// Leading numeric words are kept (`"01_filter"` → `"01"`). When fewer than
/// two characters were collected that way, the first letters of the following
/// words fill up the id (`"start"` → `"s"`, `"clean_up"` → `"cu"`).
///
/// Numbers after the first non-numeric word never join the id, so a trailing
/// counter doesn't change it (`"01_continue_1"` → `"01"`).
pub fn guess_short_id(name: &str) -> String {
    let name = name.rsplit(['.', '/', ':']).next().unwrap_or(name);
    let mut id = String::new();
    let mut numeric = true;

    for word in name.split('_').filter(|word| !word.is_empty()) {
        if numeric && word.chars().all(|c| c.is_ascii_digit()) {
            id.push_str(word);
            continue;
        }

        numeric = false;
        if id.len() < 2
            && let Some(first) = word.chars().next()
        {
            id.extend(first.to_lowercase());
        }
    }

    id
}

/// Artifact description used when a call doesn't set one: the step id
/// followed by the capitalized name, without separators.
pub fn default_description(id: &str, name: &str) -> String {
    let mut chars = name.chars().filter(|c| c.is_alphanumeric() || *c == '_');
    let capitalized: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };

    format!("{id}{}", capitalized.replace('_', ""))
}
