//! Output abstraction for the interpreter.
//!
//! Everything the interpreter prints (`debug` statements and the print
//! natives) goes through a [`PrintWriter`], so embedders and tests can
//! capture or suppress output.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Sink for interpreter output.
pub trait PrintWriter {
    /// Writes `text` exactly as given; callers append their own newlines.
    fn print(&mut self, text: &str);
}

/// Writes to the process's stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn print(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

/// Discards all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print(&mut self, _text: &str) {}
}

/// Collects output into a shared string buffer.
///
/// Clones share the buffer, so a test can keep one handle while the VM owns
/// the other:
///
/// ```
/// use oba::{CollectStringPrint, Vm};
///
/// let output = CollectStringPrint::default();
/// let mut vm = Vm::new(&[]);
/// vm.set_print_writer(Box::new(output.clone()));
/// vm.interpret("debug 40 + 2").unwrap();
/// assert_eq!(output.contents(), "42\n");
/// ```
#[derive(Debug, Default, Clone)]
pub struct CollectStringPrint {
    buffer: Rc<RefCell<String>>,
}

impl CollectStringPrint {
    /// Returns a copy of everything printed so far.
    #[must_use]
    pub fn contents(&self) -> String {
        self.buffer.borrow().clone()
    }

    /// Clears the buffer.
    pub fn reset(&self) {
        self.buffer.borrow_mut().clear();
    }
}

impl PrintWriter for CollectStringPrint {
    fn print(&mut self, text: &str) {
        self.buffer.borrow_mut().push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_string_print_shares_buffer() {
        let handle = CollectStringPrint::default();
        let mut writer = handle.clone();
        writer.print("one ");
        writer.print("two");
        assert_eq!(handle.contents(), "one two");
        handle.reset();
        assert_eq!(handle.contents(), "");
    }
}
