use std::io;

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::client::{RemoteEntry, RemoteError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self.code, 500 | 501 | 502 | 504)
    }
}

/// Reads one reply, joining the lines of a multi-line (`123-...`) reply.
pub(crate) async fn read_reply<R>(reader: &mut R) -> io::Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_control_line(reader).await?;
    let code = reply_code(&first)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed reply: {first}")))?;
    let mut text = first.get(4..).unwrap_or_default().to_string();
    if first.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{code} ");
        loop {
            let line = read_control_line(reader).await?;
            let last = line.starts_with(&terminator) || line == code.to_string();
            let body = if last || reply_code(&line) == Some(code) {
                line.get(4..).unwrap_or_default()
            } else {
                line.as_str()
            };
            text.push('\n');
            text.push_str(body.trim_start());
            if last {
                break;
            }
        }
    }
    Ok(Reply { code, text })
}

async fn read_control_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control connection closed by server",
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Maps a negative reply onto the remote error taxonomy.
pub(crate) fn reply_error(reply: &Reply, path: &str) -> RemoteError {
    match reply.code {
        450 | 550 => RemoteError::NotFound(path.to_string()),
        421 | 425 | 426 | 530 => {
            RemoteError::Connection(format!("{} {}", reply.code, reply.text.trim()))
        }
        _ => RemoteError::Other(format!("{path}: {} {}", reply.code, reply.text.trim())),
    }
}

/// Port from a `229 Entering Extended Passive Mode (|||6446|)` reply.
pub(crate) fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let inner = &text[start + 1..end];
    let delimiter = inner.chars().next()?;
    inner.split(delimiter).nth(3)?.parse().ok()
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub(crate) fn parse_pasv(text: &str) -> Option<u16> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u8> = text[start..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .take(6)
        .map(|part| part.parse().ok())
        .collect::<Option<_>>()?;
    if numbers.len() != 6 {
        return None;
    }
    Some(u16::from(numbers[4]) << 8 | u16::from(numbers[5]))
}

/// One `MLSD` fact line: `type=file;size=12;modify=20240301120000; a.txt`.
/// Returns `None` for `cdir`/`pdir`, links and lines without a name.
pub(crate) fn parse_mlsd_line(line: &str) -> Option<RemoteEntry> {
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let mut kind = None;
    let mut size = 0;
    let mut modified = None;
    for fact in facts.split(';').filter(|fact| !fact.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => kind = Some(value.to_ascii_lowercase()),
            "size" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_timeval(value),
            _ => {}
        }
    }
    let is_dir = match kind.as_deref() {
        Some("file") => false,
        Some("dir") => true,
        _ => return None,
    };
    Some(RemoteEntry {
        name: name.to_string(),
        size: if is_dir { 0 } else { size },
        modified,
        is_dir,
    })
}

/// One Unix-style `LIST` line. The timestamp there is too coarse to compare,
/// so `modified` is left empty for the caller to fill from `MDTM`.
pub(crate) fn parse_list_line(line: &str) -> Option<RemoteEntry> {
    let (fields, name) = split_fields(line, 8)?;
    let is_dir = match fields[0].chars().next()? {
        'd' => true,
        '-' => false,
        _ => return None,
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let size = if is_dir { 0 } else { fields[4].parse().ok()? };
    Some(RemoteEntry {
        name: name.to_string(),
        size,
        modified: None,
        is_dir,
    })
}

fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    while fields.len() < count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

/// `YYYYMMDDHHMMSS[.sss]` in UTC, as used by `MDTM`, `MFMT` and `MLSD`.
pub(crate) fn parse_timeval(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    let digits = value.get(..14)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = |range: std::ops::Range<usize>| digits[range].parse::<u16>().ok();
    let month = Month::try_from(u8::try_from(number(4..6)?).ok()?).ok()?;
    let date = Date::from_calendar_date(
        i32::from(number(0..4)?),
        month,
        u8::try_from(number(6..8)?).ok()?,
    )
    .ok()?;
    let time = Time::from_hms(
        u8::try_from(number(8..10)?).ok()?,
        u8::try_from(number(10..12)?).ok()?,
        u8::try_from(number(12..14)?).ok()?,
    )
    .ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

pub(crate) fn format_timeval(value: OffsetDateTime) -> String {
    let utc = value.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second()
    )
}
