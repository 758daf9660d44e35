use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    #[serde(serialize_with = "as_single_line")]
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }

    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn with_code_and_message(code: u16, message: &str) -> Self {
        let lines: Vec<&str> = message.lines().collect();

        let mut builder = ResponseBuilder::new(&ResponseLine {
            code,
            content: lines.first().copied().unwrap_or(""),
            is_final: lines.len() <= 1,
        });

        for (n, line) in lines.iter().enumerate().skip(1) {
            builder
                .add_line(&ResponseLine {
                    code,
                    content: line,
                    is_final: n == lines.len() - 1,
                })
                .ok();
        }

        builder.build(None)
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

pub(crate) fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

fn remove_line_break(data: &str) -> String {
    let data = data.as_bytes();
    let mut normalized = Vec::with_capacity(data.len());
    let mut last_idx = 0;

    for i in memchr::memchr2_iter(b'\r', b'\n', data) {
        match data[i] {
            b'\r' => {
                normalized.extend_from_slice(&data[last_idx..i]);
                if data.get(i + 1).copied() != Some(b'\n') {
                    normalized.push(b' ');
                }
            }
            b'\n' => {
                normalized.extend_from_slice(&data[last_idx..i]);
                normalized.push(b' ');
            }
            _ => unreachable!(),
        }
        last_idx = i + 1;
    }

    normalized.extend_from_slice(&data[last_idx..]);
    // This is safe because data comes from str, which is
    // guaranteed to be valid utf8, and all we're manipulating
    // above is whitespace which won't invalidate the utf8
    // byte sequences in the data byte array
    unsafe { String::from_utf8_unchecked(normalized) }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    /// Reconsitute the original line that we parsed
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

pub(crate) struct ResponseBuilder {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');

        let mut content = parsed.content;

        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{}.{}.{} ", enh.class, enh.subject, enh.detail);
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }

        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
            command,
        }
    }
}

fn as_single_line<S>(content: &String, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&remove_line_break(content))
}
