//! 文件系统的块缓存部分

mod bio;

pub use bio::{Bcache, Buf, BufData};
