use std::process::Command;

const MAX_LOG_CHARS: usize = 4096;
const SECRET_FLAGS: &[&str] = &["--password", "--access-token", "--api-key", "--client-secret"];
const MASK: &str = "***";

/// Render a command for logs with the values of secret flags masked.
pub fn redact_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    let mut mask_next = false;
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        if mask_next {
            parts.push(MASK.to_string());
            mask_next = false;
            continue;
        }
        if let Some((flag, _)) = arg.split_once('=') {
            if SECRET_FLAGS.contains(&flag) {
                parts.push(format!("{flag}={MASK}"));
                continue;
            }
        }
        if SECRET_FLAGS.contains(&arg.as_ref()) {
            mask_next = true;
        }
        parts.push(arg.into_owned());
    }
    parts.join(" ")
}

/// Mask every occurrence of `secret` in free text (subprocess output may echo it).
pub fn redact_text(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, MASK)
}

/// One log line of subprocess output: ANSI/OSC sequences and control
/// characters dropped, tabs turned into spaces, length capped.
pub fn clean_output_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters until a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC / DCS / PM / APC: until BEL or ESC '\'.
                Some(']' | 'P' | 'X' | '^' | '_') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() || is_bidi_control(c) {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_password_values() {
        let mut cmd = Command::new("jf");
        cmd.args(["config", "add", "rt", "--user", "buildguy", "--password", "hunter2"]);
        let shown = redact_command(&cmd);
        assert_eq!(shown, "jf config add rt --user buildguy --password ***");
    }

    #[test]
    fn masks_inline_flag_values() {
        let mut cmd = Command::new("jf");
        cmd.arg("--password=hunter2").arg("--user=buildguy");
        let shown = redact_command(&cmd);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("--user=buildguy"));
    }

    #[test]
    fn redacts_echoed_secrets() {
        assert_eq!(redact_text("bad password hunter2", "hunter2"), "bad password ***");
        assert_eq!(redact_text("unchanged", ""), "unchanged");
    }

    #[test]
    fn strips_escape_sequences_and_controls() {
        let input = "ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7}done\r\n\u{202e}";
        assert_eq!(clean_output_line(input), "ok red done");
        assert_eq!(clean_output_line("a\u{1b}Ppayload\u{1b}\\b\tc"), "ab c");
    }
}
