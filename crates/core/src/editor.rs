//! Scoped editing of a packed body.
//!
//! Opening an editor decodes the body into a stream; closing it re-encodes
//! the stream back over the body. Re-encoding happens on every exit path:
//! [`MethodEditor::finish`] reports its outcome, and dropping an unfinished
//! editor still writes back (logging, rather than surfacing, a failure).
//! Use [`edit`] for the common scoped form.

use crate::balloon::balloon;
use crate::body::CodeBody;
use crate::result::Result;
use crate::stream::MethodStream;
use crate::sync::sync;
use tracing::warn;

/// An open editing session over one method body.
#[derive(Debug)]
pub struct MethodEditor<'a> {
    body: &'a mut CodeBody,
    stream: Option<MethodStream>,
}

impl<'a> MethodEditor<'a> {
    /// Decode the body and begin editing.
    pub fn open(body: &'a mut CodeBody) -> Result<Self> {
        let stream = balloon(body)?;
        Ok(MethodEditor {
            body,
            stream: Some(stream),
        })
    }

    /// The editable stream.
    pub fn stream(&mut self) -> &mut MethodStream {
        self.stream.as_mut().expect("editor still open")
    }

    fn write_back(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            *self.body = sync(&mut stream)?;
        }
        Ok(())
    }

    /// Re-encode into the body and close.
    pub fn finish(mut self) -> Result<()> {
        self.write_back()
    }
}

impl Drop for MethodEditor<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.write_back() {
            warn!("write-back on drop failed: {}", e);
        }
    }
}

/// Balloon `body`, run `f` over the stream, and sync the result back —
/// also when `f` fails. The closure's error wins over a write-back error.
pub fn edit<T>(
    body: &mut CodeBody,
    f: impl FnOnce(&mut MethodStream) -> Result<T>,
) -> Result<T> {
    let mut editor = MethodEditor::open(body)?;
    let outcome = f(editor.stream());
    let written = editor.finish();
    let value = outcome?;
    written?;
    Ok(value)
}
