use crate::{readable::ReadableStream, writable::WritableStream};

/// An object containing a pair of linked streams, one readable and one writable
/// https://streams.spec.whatwg.org/#dictdef-readablewritablepair
#[derive(Clone, Debug)]
pub struct ReadableWritablePair {
    pub readable: ReadableStream,
    pub writable: WritableStream,
}
