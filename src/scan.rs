use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};

const BLOCK: usize = 4096;

/// Position a seekable source just after its last `count` lines and return
/// that offset. Scans backward in fixed-size blocks counting newlines; a
/// trailing newline terminates the final line and does not open a new one.
/// `count == 0` leaves the source at end-of-file.
pub fn seek_last_lines<S: Read + Seek>(src: &mut S, count: u64) -> io::Result<u64> {
    let size = src.seek(SeekFrom::End(0))?;
    if count == 0 || size == 0 {
        return Ok(size);
    }
    let mut scan = size;
    {
        let mut last = [0u8; 1];
        src.seek(SeekFrom::Start(size - 1))?;
        src.read_exact(&mut last)?;
        if last[0] == b'\n' {
            scan -= 1;
        }
    }
    let mut buf = [0u8; BLOCK];
    let mut found = 0u64;
    while scan > 0 {
        let chunk = std::cmp::min(scan, BLOCK as u64) as usize;
        let start = scan - chunk as u64;
        src.seek(SeekFrom::Start(start))?;
        src.read_exact(&mut buf[..chunk])?;
        for i in (0..chunk).rev() {
            if buf[i] == b'\n' {
                found += 1;
                if found == count {
                    let off = start + i as u64 + 1;
                    src.seek(SeekFrom::Start(off))?;
                    return Ok(off);
                }
            }
        }
        scan = start;
    }
    // fewer than `count` lines: the whole source qualifies
    src.seek(SeekFrom::Start(0))?;
    Ok(0)
}

/// Consume a non-seekable stream to end-of-file and return its last `count`
/// lines as raw bytes. Memory stays bounded by the retained lines: completed
/// lines beyond `count` are dropped as reading proceeds.
pub fn last_lines_stream<R: Read>(src: &mut R, count: u64) -> io::Result<Vec<u8>> {
    let mut lines: VecDeque<Vec<u8>> = VecDeque::new();
    let mut partial: Vec<u8> = Vec::new();
    let mut buf = [0u8; BLOCK];
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for &b in &buf[..n] {
            partial.push(b);
            if b == b'\n' {
                lines.push_back(std::mem::take(&mut partial));
                if lines.len() as u64 > count {
                    lines.pop_front();
                }
            }
        }
    }
    if !partial.is_empty() {
        lines.push_back(partial);
        if lines.len() as u64 > count {
            lines.pop_front();
        }
    }
    if count == 0 {
        return Ok(Vec::new());
    }
    Ok(lines.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn seek_in(data: &[u8], count: u64) -> (u64, Vec<u8>) {
        let mut cur = Cursor::new(data.to_vec());
        let off = seek_last_lines(&mut cur, count).unwrap();
        let mut rest = Vec::new();
        cur.read_to_end(&mut rest).unwrap();
        (off, rest)
    }

    #[test]
    fn last_lines_with_trailing_newline() {
        let (off, rest) = seek_in(b"a\nb\nc\n", 2);
        assert_eq!(off, 2);
        assert_eq!(rest, b"b\nc\n");
    }

    #[test]
    fn last_lines_without_trailing_newline() {
        let (off, rest) = seek_in(b"a\nb\nc", 1);
        assert_eq!(off, 4);
        assert_eq!(rest, b"c");
    }

    #[test]
    fn count_exceeding_line_total_keeps_everything() {
        let (off, rest) = seek_in(b"x\ny\n", 10);
        assert_eq!(off, 0);
        assert_eq!(rest, b"x\ny\n");
    }

    #[test]
    fn zero_count_positions_at_end() {
        let (off, rest) = seek_in(b"x\ny\n", 0);
        assert_eq!(off, 4);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_source() {
        let (off, rest) = seek_in(b"", 5);
        assert_eq!(off, 0);
        assert!(rest.is_empty());
    }

    #[test]
    fn spans_multiple_blocks() {
        let mut data = Vec::new();
        for i in 0..3000 {
            data.extend_from_slice(format!("line {i}\n").as_bytes());
        }
        let (_, rest) = seek_in(&data, 2);
        assert_eq!(rest, b"line 2998\nline 2999\n");
    }

    #[test]
    fn stream_keeps_last_lines_only() {
        let mut src = Cursor::new(b"1\n2\n3\n4\n".to_vec());
        let out = last_lines_stream(&mut src, 2).unwrap();
        assert_eq!(out, b"3\n4\n");
    }

    #[test]
    fn stream_retains_unterminated_tail() {
        let mut src = Cursor::new(b"1\n2\ntail".to_vec());
        let out = last_lines_stream(&mut src, 2).unwrap();
        assert_eq!(out, b"2\ntail");
    }

    #[test]
    fn stream_zero_count_discards_all() {
        let mut src = Cursor::new(b"1\n2\n".to_vec());
        let out = last_lines_stream(&mut src, 0).unwrap();
        assert!(out.is_empty());
    }
}
