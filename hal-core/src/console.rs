/// A source of operator input for the kernel monitor.
pub trait ReadLine {
    /// Block until the operator enters a line of text, writing it into `buf`.
    ///
    /// Returns the line, without its terminating newline. Input longer than
    /// `buf` is truncated.
    fn read_line<'buf>(&self, buf: &'buf mut [u8]) -> &'buf str;
}
