//! Multipart form encoding for result uploads
//!
//! Workers upload crawled payloads as `multipart/form-data` bodies. The
//! boundary string is fixed so the bodies produced here are bit-compatible
//! with what legacy workers send; the coordinator parses uploads with a
//! general multipart parser, so it accepts any boundary, but everything this
//! codebase emits uses this one.

/// The fixed multipart boundary. Must not change: the wire format is part of
/// the worker/coordinator contract.
pub const BOUNDARY: &str = "----------ThIs_Is_tHe_bouNdaRY_$";

const CRLF: &str = "\r\n";

/// A file-style part of a multipart form: uploaded with a filename and an
/// `application/octet-stream` content type.
#[derive(Debug, Clone)]
pub struct FilePart<'a> {
    pub name: &'a str,
    pub filename: &'a str,
    pub data: &'a [u8],
}

/// The `Content-Type` header value matching bodies built by [`encode_form`].
pub fn content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}

/// Encode plain form fields and file parts into a multipart body.
///
/// Layout per part: boundary line, `Content-Disposition` header (plus a
/// `Content-Type: application/octet-stream` line for files), a blank line,
/// then the value. The body is closed with `--<boundary>--` and a final
/// CRLF. Line terminator is CRLF throughout.
pub fn encode_form(fields: &[(&str, &str)], files: &[FilePart<'_>]) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    for (name, value) in fields {
        push_line(&mut body, &format!("--{}", BOUNDARY));
        push_line(
            &mut body,
            &format!("Content-Disposition: form-data; name=\"{}\"", name),
        );
        push_line(&mut body, "");
        push_line(&mut body, value);
    }
    for part in files {
        push_line(&mut body, &format!("--{}", BOUNDARY));
        push_line(
            &mut body,
            &format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"",
                part.name, part.filename
            ),
        );
        push_line(&mut body, "Content-Type: application/octet-stream");
        push_line(&mut body, "");
        body.extend_from_slice(part.data);
        body.extend_from_slice(CRLF.as_bytes());
    }
    push_line(&mut body, &format!("--{}--", BOUNDARY));
    body
}

fn push_line(body: &mut Vec<u8>, line: &str) {
    body.extend_from_slice(line.as_bytes());
    body.extend_from_slice(CRLF.as_bytes());
}
