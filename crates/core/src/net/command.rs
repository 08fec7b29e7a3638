/// Control commands the connection layer itself reacts to. Everything else is
/// handed to game logic untouched as [`ServerCommand::Game`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Disconnect { reason: Option<String> },
    ConfigString { index: i64, value: String },
    LevelShot,
    Game { verb: String, args: Vec<String> },
}

impl ServerCommand {
    pub fn parse(text: &str) -> Self {
        let mut tokens = tokenize(text).into_iter();
        let verb = tokens.next().unwrap_or_default();
        let args: Vec<String> = tokens.collect();

        match verb.as_str() {
            "disconnect" => ServerCommand::Disconnect {
                reason: args.into_iter().next(),
            },
            "cs" => ServerCommand::ConfigString {
                index: args.first().map(|a| parse_leading_int(a)).unwrap_or(0),
                value: args.get(1).cloned().unwrap_or_default(),
            },
            "clientLevelShot" => ServerCommand::LevelShot,
            _ => ServerCommand::Game { verb, args },
        }
    }

    pub fn verb(&self) -> &str {
        match self {
            ServerCommand::Disconnect { .. } => "disconnect",
            ServerCommand::ConfigString { .. } => "cs",
            ServerCommand::LevelShot => "clientLevelShot",
            ServerCommand::Game { verb, .. } => verb,
        }
    }

    /// Text form that [`ServerCommand::parse`] reads back to the same value.
    pub fn to_command_string(&self) -> String {
        match self {
            ServerCommand::Disconnect { reason: Some(reason) } => {
                format!("disconnect \"{}\"", strip_quotes(reason))
            }
            ServerCommand::Disconnect { reason: None } => "disconnect".to_string(),
            ServerCommand::ConfigString { index, value } => {
                format!("cs {} \"{}\"", index, strip_quotes(value))
            }
            ServerCommand::LevelShot => "clientLevelShot".to_string(),
            ServerCommand::Game { verb, args } => {
                let mut out = verb.clone();
                for arg in args {
                    out.push_str(" \"");
                    out.push_str(&strip_quotes(arg));
                    out.push('"');
                }
                out
            }
        }
    }
}

/// Who a server command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    All,
    Client(usize),
}

fn strip_quotes(text: &str) -> String {
    text.replace('"', "'")
}

/// `atoi` semantics: optional sign then leading digits, anything else is 0.
pub fn parse_leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end]
        .parse::<i64>()
        .map(|v| sign * v)
        .unwrap_or(0)
}

/// Splits a command line into arguments: whitespace separated, `"..."`
/// grouped, `//` ends the line and `/* ... */` is skipped.
pub fn tokenize(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    loop {
        while i < bytes.len() && bytes[i] <= b' ' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        if bytes[i..].starts_with(b"//") {
            break;
        }
        if bytes[i..].starts_with(b"/*") {
            match text[i + 2..].find("*/") {
                Some(end) => {
                    i += 2 + end + 2;
                    continue;
                }
                None => break,
            }
        }

        if bytes[i] == b'"' {
            let start = i + 1;
            let end = text[start..]
                .find('"')
                .map(|off| start + off)
                .unwrap_or(bytes.len());
            tokens.push(text[start..end].to_string());
            i = (end + 1).min(bytes.len());
            continue;
        }

        let start = i;
        while i < bytes.len()
            && bytes[i] > b' '
            && bytes[i] != b'"'
            && !bytes[i..].starts_with(b"//")
            && !bytes[i..].starts_with(b"/*")
        {
            i += 1;
        }
        tokens.push(text[start..i].to_string());
    }

    tokens
}
