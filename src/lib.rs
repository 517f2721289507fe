pub mod error;
pub mod codec;
pub mod property;
pub mod block;
pub mod info_block;
pub mod message;
pub mod queue;
pub mod encoder;
pub mod decoder;
pub mod archive;

pub use error::{CellError, CellResult, FormatError};
pub use codec::{CodecError, DeflateCodec};
pub use block::{Entry, EntryHeader, EntryKind};
pub use info_block::InfoBlock;
pub use message::{ChannelSink, Message, MessageLevel, MessageSink, NullSink, TracingSink};
pub use queue::{BoundedQueue, CancellationToken};
pub use encoder::{encode, EncodeOptions, Encoder};
pub use decoder::{decode, DecodeOptions, DecodeReport, Decoder, EntryReader};
pub use archive::{Cell, EntrySummary};
