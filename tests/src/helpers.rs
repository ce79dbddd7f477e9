use dexloom_core::{sync, CodeBody, MethodStream};

/// Build a stream with the closure and encode it into a fixture body.
pub fn assemble(regs: u16, ins: u16, build: impl FnOnce(&mut MethodStream)) -> CodeBody {
    let mut stream = MethodStream::new(regs, ins);
    build(&mut stream);
    sync(&mut stream).expect("fixture body encodes")
}
