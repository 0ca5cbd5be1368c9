use std::borrow::Cow;

use glob::{MatchOptions, Pattern};
use percent_encoding::percent_decode_str;

use super::FilterError;

const SEGMENT_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One `/`-separated component of a rule path.
#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `:name`, matches exactly one segment.
    Param,
    /// `*`, matches one segment, or every remaining segment when last.
    Wildcard,
    Glob(Pattern),
}

/// Compiled rule path.
///
/// Matching happens on percent-decoded segments, after the path has been split
/// on literal `/` only. An encoded `%2F` therefore stays inside its segment and
/// can never satisfy a rule that expects a segment boundary there.
#[derive(Debug, Clone)]
pub(crate) struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub(crate) fn parse(pattern: &str) -> Result<Self, FilterError> {
        let trimmed = pattern.strip_prefix('/').unwrap_or(pattern);
        let segments = trimmed
            .split('/')
            .map(|raw| {
                let segment = decode_segment(raw).unwrap_or(Cow::Borrowed(raw));
                if segment == "*" {
                    Ok(Segment::Wildcard)
                } else if segment.starts_with(':') && segment.len() > 1 {
                    Ok(Segment::Param)
                } else if segment.contains(['*', '?', '[']) {
                    Pattern::new(&segment)
                        .map(Segment::Glob)
                        .map_err(|source| FilterError::invalid_pattern(pattern, source))
                } else {
                    Ok(Segment::Literal(segment.into_owned()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    /// Matches a raw (still percent-encoded) request path without query.
    ///
    /// A path with a `.` or `..` segment, encoded or not, never matches: the
    /// origin URL would resolve it to a path the rule did not evaluate.
    pub(crate) fn matches(&self, raw_path: &str) -> bool {
        let Some(rest) = raw_path.strip_prefix('/') else {
            return false;
        };
        let mut decoded = Vec::new();
        for raw in rest.split('/') {
            match decode_segment(raw) {
                Some(segment) if segment == "." || segment == ".." => return false,
                Some(segment) => decoded.push(segment),
                None => return false,
            }
        }
        match_segments(&self.segments, &decoded)
    }
}

fn match_segments(pattern: &[Segment], path: &[Cow<'_, str>]) -> bool {
    match (pattern.split_first(), path.split_first()) {
        (None, None) => true,
        (Some((Segment::Wildcard, [])), Some(_)) => true,
        (Some((head, pattern_rest)), Some((segment, path_rest))) => {
            let matched = match head {
                Segment::Literal(literal) => literal == segment,
                Segment::Param | Segment::Wildcard => !segment.is_empty(),
                Segment::Glob(glob) => glob.matches_with(segment, SEGMENT_MATCH),
            };
            matched && match_segments(pattern_rest, path_rest)
        }
        _ => false,
    }
}

/// Percent-decodes one segment, `None` when the result is not UTF-8.
fn decode_segment(raw: &str) -> Option<Cow<'_, str>> {
    percent_decode_str(raw).decode_utf8().ok()
}

#[cfg(test)]
mod tests {
    use super::PathPattern;

    fn matches(pattern: &str, path: &str) -> bool {
        PathPattern::parse(pattern).unwrap().matches(path)
    }

    #[test]
    fn literal_and_params() {
        assert!(matches("/echo-body", "/echo-body"));
        assert!(!matches("/echo-body", "/echo-body/extra"));
        assert!(matches("/echo-param/:param", "/echo-param/xyz"));
        assert!(!matches("/echo-param/:param", "/echo-param/"));
        assert!(!matches("/echo-param/:param", "/echo-param/a/b"));
    }

    #[test]
    fn trailing_wildcard_spans_segments() {
        assert!(matches("/long/nested/*", "/long/nested/a"));
        assert!(matches("/long/nested/*", "/long/nested/a/b/c.ext"));
        assert!(!matches("/long/nested/*", "/long/nested"));
        assert!(matches("/repos/*/contents", "/repos/x/contents"));
        assert!(!matches("/repos/*/contents", "/repos/x/y/contents"));
    }

    #[test]
    fn encoded_separator_does_not_split_segments() {
        let pattern = "/long/nested/*";
        assert!(!matches(pattern, "/long/nested%2Fpath%2Fto%2Ffile.ext"));
        assert!(matches(
            pattern,
            "/long/nested/partially/encoded%2Fpath%2Fto%2Ffile.ext"
        ));
        // double encoding decodes once, to a literal `%2F`
        assert!(!matches("/a/b", "/a%252Fb"));
    }

    #[test]
    fn glob_stays_within_segment() {
        assert!(matches("/files/*.ext", "/files/one.ext"));
        assert!(!matches("/files/*.ext", "/files/a%2Fone.ext"));
        assert!(!matches("/files/*.ext", "/files/one.txt"));
    }

    #[test]
    fn malformed_input_never_matches() {
        assert!(!matches("/*", "no-leading-slash"));
        assert!(!matches("/:p", "/%FF%FE"));
        assert!(matches("/caf%C3%A9", "/café"));
    }

    #[test]
    fn dot_segments_never_match() {
        let pattern = "/api/*";
        assert!(!matches(pattern, "/api/../admin/secret"));
        assert!(!matches(pattern, "/api/%2e%2e/admin/secret"));
        assert!(!matches(pattern, "/api/%2E%2E/%2e%2e/etc"));
        assert!(!matches(pattern, "/api/./x"));
        assert!(!matches(pattern, "/api/%2e/x"));
        assert!(!matches("/*", "/.."));
        // dots inside a segment are ordinary characters
        assert!(matches(pattern, "/api/..x/y"));
        assert!(matches(pattern, "/api/.well-known"));
    }
}
