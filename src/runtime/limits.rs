// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Size of a pooled header region. This is the upper bound for
/// `header_len + message_len` on the piggyback send path.
pub const HEADER_REGION_SIZE: usize = 4096;

/// Size of a pooled message region.
pub const MESSAGE_REGION_SIZE: usize = 65536;

/// Maximum number of zero-copy chunks attached to a single outgoing message.
pub const MAX_ZERO_COPY_CHUNKS: usize = 16;

/// Maximum number of chunk descriptors that piggyback inside the header
/// region. Beyond this, the chunk table travels in its own pinned block.
pub const MAX_INLINE_CHUNKS: usize = 32;

/// Default number of senders kept in the sender pool.
pub const DEFAULT_SENDER_POOL_SIZE: usize = 16;

/// Default per-node fanout of the broadcast tree.
pub const DEFAULT_BROADCAST_FANOUT: usize = 16;
