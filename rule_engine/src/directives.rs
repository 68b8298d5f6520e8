// Line-level helpers for SecLang-style rule text.
//
// Rule semantics are out of scope; these only split content into logical
// directives so the compiler can check syntax and spot duplicate rule ids.

/// A directive after joining `\` continuations, tagged with the physical line
/// it starts on (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub line_number: usize,
    pub text: String,
}

impl LogicalLine {
    pub fn is_comment(&self) -> bool {
        self.text.trim_start().starts_with('#')
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// First whitespace-delimited token, e.g. `SecRule`.
    pub fn directive_name(&self) -> Option<&str> {
        if self.is_comment() {
            return None;
        }
        self.text.split_whitespace().next()
    }
}

/// Split content into logical lines, joining trailing-backslash continuations.
///
/// Returns the lines plus whether the final line ended in a dangling `\`.
pub fn logical_lines(content: &str) -> (Vec<LogicalLine>, bool) {
    let mut lines = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for (idx, raw) in content.lines().enumerate() {
        let (body, continues) = match raw.trim_end().strip_suffix('\\') {
            Some(body) => (body, true),
            None => (raw, false),
        };

        let line = pending.get_or_insert_with(|| LogicalLine {
            line_number: idx + 1,
            text: String::new(),
        });
        line.text.push_str(body);

        if !continues {
            if let Some(done) = pending.take() {
                lines.push(done);
            }
        }
    }

    let dangling = pending.is_some();
    if let Some(rest) = pending {
        lines.push(rest);
    }
    (lines, dangling)
}

/// Whether the unescaped double quotes on a line are balanced.
pub fn quotes_balanced(text: &str) -> bool {
    let mut open = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => open = !open,
            _ => {}
        }
    }
    !open
}

/// Split a directive into its arguments. Double-quoted arguments are
/// unquoted; escapes inside them are kept as written.
pub fn arguments(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if quoted || !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if quoted || !current.is_empty() {
        args.push(current);
    }
    args
}

/// Split an action list on commas outside single quotes.
fn actions(list: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;
    list.split(move |c: char| {
        if c == '\'' {
            in_quotes = !in_quotes;
        }
        c == ',' && !in_quotes
    })
    .map(str::trim)
}

/// The numeric `id:` action declared by a rule directive, if any.
///
/// Only the action list is searched: the third argument of `SecRule`, the
/// first of `SecAction`. Variables and operator text may mention `id:` freely.
pub fn declared_rule_id(line: &LogicalLine) -> Option<u64> {
    let name = line.directive_name()?;
    let position = if name.eq_ignore_ascii_case("SecRule") {
        3
    } else if name.eq_ignore_ascii_case("SecAction") {
        1
    } else {
        return None;
    };

    let args = arguments(&line.text);
    let list = args.get(position)?;
    let id = actions(list).find_map(|action| {
        let (key, value) = action.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("id") {
            return None;
        }
        value.trim().trim_matches('\'').parse().ok()
    });
    id
}
