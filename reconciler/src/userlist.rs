//! The pooler's auth file: one `"username" "hash"` pair per line.

use indexmap::IndexMap;
use std::fmt;
use tracing::warn;

/// Ordered username to password hash mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Userlist {
    entries: IndexMap<String, String>,
}

impl Userlist {
    pub fn new() -> Self {
        Userlist::default()
    }

    /// Parses auth file text. Lines that are not exactly two quoted fields are
    /// skipped with a warning so one bad line does not drop every credential.
    pub fn parse(text: &str) -> Self {
        let mut userlist = Userlist::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            match parse_line(line) {
                Some((username, hash)) => userlist.upsert(username, hash),
                None => warn!(line = idx + 1, "skipping malformed auth file line"),
            }
        }

        userlist
    }

    /// Replaces the hash of an existing user in place or appends a new user.
    pub fn upsert<U, H>(&mut self, username: U, hash: H)
    where
        U: Into<String>,
        H: Into<String>,
    {
        self.entries.insert(username.into(), hash.into());
    }

    /// Returns whether the user was present.
    pub fn remove(&mut self, username: &str) -> bool {
        self.entries.shift_remove(username).is_some()
    }

    pub fn get(&self, username: &str) -> Option<&str> {
        self.entries.get(username).map(String::as_str)
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let (username, rest) = quoted(line.trim_start())?;
    let (hash, rest) = quoted(rest.trim_start())?;

    if !rest.trim().is_empty() {
        return None;
    }
    Some((username, hash))
}

// Reads one double quoted field, where `""` stands for a literal quote.
fn quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut value = String::new();
    let mut chars = body.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c != '"' {
            value.push(c);
            continue;
        }

        if let Some((_, '"')) = chars.peek() {
            chars.next();
            value.push('"');
        } else {
            return Some((value, &body[idx + 1..]));
        }
    }

    None
}

fn escape(value: &str) -> String {
    value.replace('"', "\"\"")
}

impl fmt::Display for Userlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (username, hash)) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "\"{}\" \"{}\"", escape(username), escape(hash))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_appends() {
        let mut userlist = Userlist::parse(r#""alice" "md5abc""#);
        userlist.upsert("bob", "md5def");

        assert_eq!(
            userlist.to_string(),
            "\"alice\" \"md5abc\"\n\"bob\" \"md5def\""
        );
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut userlist = Userlist::parse("\"a\" \"1\"\n\"b\" \"2\"\n\"c\" \"3\"");
        userlist.upsert("b", "20");

        assert_eq!(userlist.to_string(), "\"a\" \"1\"\n\"b\" \"20\"\n\"c\" \"3\"");
    }

    #[test]
    fn test_remove() {
        let mut userlist = Userlist::parse("\"a\" \"1\"\n\"b\" \"2\"\n\"c\" \"3\"");

        assert!(userlist.remove("b"));
        assert!(!userlist.remove("b"));
        assert_eq!(userlist.to_string(), "\"a\" \"1\"\n\"c\" \"3\"");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let text = "\"a\" \"1\"\nnot quoted\n\"b\"\n\"c\" \"3\" \"extra\"\n\n\"d\" \"4\"\n";
        let userlist = Userlist::parse(text);

        assert_eq!(userlist.usernames().collect::<Vec<_>>(), vec!["a", "d"]);
        assert_eq!(userlist.get("d"), Some("4"));
    }

    #[test]
    fn test_escaped_quotes_round_trip() {
        let mut userlist = Userlist::new();
        userlist.upsert("we\"ird", "SCRAM-SHA-256$4096:abc");

        let text = userlist.to_string();
        assert_eq!(text, "\"we\"\"ird\" \"SCRAM-SHA-256$4096:abc\"");
        assert_eq!(Userlist::parse(&text), userlist);
    }

    #[test]
    fn test_empty() {
        let userlist = Userlist::parse("");
        assert!(userlist.is_empty());
        assert_eq!(userlist.to_string(), "");
    }
}
