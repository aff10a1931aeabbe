use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_CHUNKS: usize = 3;
pub const MAX_WORDS: usize = 20;

static SENTENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.!?]+[.!?]?").expect("static regex"));
static STRIPPED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[!.,:;()\[\]{}"'\\]"#).expect("static regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("static regex"));

/// Sentences with their terminator. Two or fewer are returned as they are; otherwise the tail is
/// folded into a third piece.
pub fn split_sentences(reply: &str) -> Vec<String> {
    let parts: Vec<&str> = SENTENCE.find_iter(reply).map(|m| m.as_str()).collect();
    if parts.is_empty() {
        return vec![reply.to_string()];
    }
    if parts.len() <= 2 {
        return parts.into_iter().map(str::to_string).collect();
    }
    vec![parts[0].to_string(), parts[1].to_string(), parts[2..].join(" ")]
}

pub fn normalize_chunk(chunk: &str) -> String {
    let stripped = STRIPPED.replace_all(chunk, "");
    let collapsed = SPACES.replace_all(&stripped, " ");
    let lowered = collapsed.to_lowercase();
    let words: Vec<&str> = lowered.trim().split(' ').take(MAX_WORDS).collect();
    words.join(" ").trim().to_string()
}

pub fn prepare_chunks(reply: &str) -> Vec<String> {
    split_sentences(reply)
        .iter()
        .map(|c| normalize_chunk(c))
        .filter(|c| !c.is_empty())
        .take(MAX_CHUNKS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sentence_is_one_chunk() {
        assert_eq!(prepare_chunks("Do you like cats?"), vec!["do you like cats?"]);
    }

    #[test]
    fn two_sentences_become_two_chunks() {
        assert_eq!(prepare_chunks("haha nice. what about you?"), vec!["haha nice", "what about you?"]);
    }

    #[test]
    fn remainder_is_folded_into_third_chunk() {
        let chunks = prepare_chunks("omg. that's wild! i'd love that. maybe. who knows?");
        assert_eq!(chunks, vec!["omg", "thats wild", "id love that maybe who knows?"]);
    }

    #[test]
    fn chunks_are_capped_at_twenty_words() {
        let long = (0..30).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = prepare_chunks(&long);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].split(' ').count(), MAX_WORDS);
        assert!(chunks[0].ends_with("w19"));
    }

    #[test]
    fn strips_punctuation_and_collapses_whitespace() {
        assert_eq!(normalize_chunk("  \"Well,   (maybe)\" [lol]; ok:  "), "well maybe lol ok");
        assert_eq!(normalize_chunk(r"a\b"), "ab");
    }

    #[test]
    fn reply_of_only_punctuation_yields_nothing() {
        assert!(prepare_chunks("...!!").is_empty());
        assert!(prepare_chunks("").is_empty());
    }
}
