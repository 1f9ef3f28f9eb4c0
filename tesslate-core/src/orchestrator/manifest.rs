//! `TESSLATE.md` declarative manifest parsing (§6, §4.H-D step 3): a
//! project-root markdown file that can pin the dev server's port and start
//! command without the orchestrator having to guess from `package.json`.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub port: Option<u16>,
    pub start_command: Option<String>,
}

static PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\*\*Port\*\*:\s*(\d+)").expect("valid regex"));

static START_COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\*\*Start Command\*\*:\s*```bash\s*\n(.*?)```").expect("valid regex")
});

static CD_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cd\s+(?P<path>[^\s&]+)").expect("valid regex"));

/// Parse a `TESSLATE.md` document, returning whatever fields are present.
/// Absence of either section is not an error — callers fall back to
/// overrides or framework auto-detection.
pub fn parse(document: &str) -> Manifest {
    let port = PORT_RE
        .captures(document)
        .and_then(|c| c[1].parse::<u16>().ok());

    let start_command = START_COMMAND_RE
        .captures(document)
        .map(|c| build_start_command(&c[1]));

    Manifest {
        port,
        start_command,
    }
}

/// Split the fenced block into lines, drop blanks and comments, and if any
/// line is backgrounded with `&`, rewrite `cd <rel>` to an absolute `/app`
/// path, parenthesize every line (moving a line's own `&` outside its
/// parens), and append `wait` only when every line is backgrounded, so the
/// container does not exit the moment only background processes remain (§6).
fn build_start_command(body: &str) -> String {
    let lines: Vec<&str> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();

    let any_backgrounded = lines.iter().any(|line| line.ends_with('&'));
    if !any_backgrounded {
        return lines.join("\n");
    }

    let pieces: Vec<String> = lines
        .iter()
        .map(|line| {
            let backgrounded = line.ends_with('&');
            let body = if backgrounded { &line[..line.len() - 1] } else { line };
            let body = rewrite_cd_to_absolute(body);
            if backgrounded {
                format!("({body}) &")
            } else {
                format!("({body})")
            }
        })
        .collect();

    let all_backgrounded = lines.iter().all(|line| line.ends_with('&'));
    if all_backgrounded {
        format!("{}; wait", pieces.join(" "))
    } else {
        pieces.join(" ")
    }
}

fn rewrite_cd_to_absolute(line: &str) -> String {
    if let Some(caps) = CD_LINE_RE.captures(line) {
        let path = &caps["path"];
        if !path.starts_with('/') {
            let absolute = format!("cd /app/{path}");
            return line.replacen(&caps[0], &absolute, 1);
        }
    }
    line.to_string()
}
