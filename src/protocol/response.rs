use std::fmt;
use std::io::Write;

/// Status lines and canned bodies for every outcome that is answered
/// without a file.
pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the request file.\n";
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// Fixed-capacity buffer the status line and headers are composed into.
///
/// Every `add_*` call either appends completely or leaves the buffer
/// untouched and returns false.
pub struct ResponseBuf {
    buf: Vec<u8>,
    len: usize,
}

impl ResponseBuf {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut window = &mut self.buf[self.len..];
        let before = window.len();
        if window.write_fmt(args).is_err() {
            return false;
        }
        self.len += before - window.len();
        true
    }

    pub fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {status} {title}\r\n"))
    }

    pub fn add_headers(&mut self, content_length: usize, keep_alive: bool) -> bool {
        self.add_content_length(content_length)
            && self.add_content_type()
            && self.add_linger(keep_alive)
            && self.add_blank_line()
    }

    pub fn add_content_length(&mut self, content_length: usize) -> bool {
        self.add_response(format_args!("Content-Length: {content_length}\r\n"))
    }

    pub fn add_content_type(&mut self) -> bool {
        self.add_response(format_args!("Content-Type: text/html\r\n"))
    }

    pub fn add_linger(&mut self, keep_alive: bool) -> bool {
        let value = if keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Connection: {value}\r\n"))
    }

    pub fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    pub fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{content}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_status_and_headers() {
        let mut buf = ResponseBuf::with_capacity(256);
        assert!(buf.add_status_line(404, ERROR_404_TITLE));
        assert!(buf.add_headers(ERROR_404_FORM.len(), false));
        assert!(buf.add_content(ERROR_404_FORM));

        let text = std::str::from_utf8(buf.as_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", ERROR_404_FORM.len())));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Connection: close\r\n\r\n"));
        assert!(text.ends_with(ERROR_404_FORM));
    }

    #[test]
    fn overflow_leaves_buffer_untouched() {
        let mut buf = ResponseBuf::with_capacity(24);
        assert!(buf.add_status_line(200, OK_200_TITLE));
        let before = buf.len();
        assert!(!buf.add_content_length(123_456_789));
        assert_eq!(buf.len(), before);
    }
}
