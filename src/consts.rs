//! 缓存层的编译期配置常量

/// 缓冲块（slot）的总数。
///
/// 同时被固定引用（持有或 pin）的块数超过该值时，`bget` 会直接 panic。
pub const NBUF: usize = 30;

/// 哈希桶（分片）数量，块号按 `blockno % NBUCKET` 映射到桶。
///
/// 与 `NBUF` 相互独立，不要求整除关系。
pub const NBUCKET: usize = 13;

/// 磁盘块大小（字节）。
pub const BSIZE: usize = 1024;
