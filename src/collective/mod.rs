// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod broadcast;

//==============================================================================
// Exports
//==============================================================================

pub use self::broadcast::{
    broadcast_recv,
    broadcast_send,
    calculate_fanout,
    generate_locality_indices,
    install_broadcast_handlers,
    TAG_BROADCAST_DIRECT,
    TAG_BROADCAST_TREE,
};
