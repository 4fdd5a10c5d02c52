// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-task record of the allocations handed to the codec runtime.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::MemoryBlock;
use crate::runtime::FrameAllocResponse;
use crate::runtime::FrameInfo;
use crate::runtime::MemId;
use crate::runtime::ResponseKey;

/// Everything created for one allocation response.
pub struct ResponseData {
    pub(crate) mids: Arc<[MemId]>,
    pub(crate) blocks: Vec<Arc<dyn MemoryBlock>>,
    pub(crate) num_frames: u16,
    pub(crate) info: FrameInfo,
    pub(crate) response: FrameAllocResponse,
}

impl ResponseData {
    pub fn key(&self) -> ResponseKey {
        self.response.key()
    }

    pub fn mids(&self) -> &[MemId] {
        &self.mids
    }

    pub fn num_frames(&self) -> u16 {
        self.num_frames
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }
}

/// Saved responses of a task, keyed by the identity of their memory id array.
#[derive(Default)]
pub struct Ledger {
    entries: HashMap<ResponseKey, ResponseData>,
    /// Insertion order, most recent last.
    order: Vec<ResponseKey>,
}

impl Ledger {
    pub fn insert(&mut self, data: ResponseData) -> ResponseKey {
        let key = data.key();
        debug_assert!(!self.entries.contains_key(&key));

        self.entries.insert(key, data);
        self.order.push(key);

        key
    }

    pub fn remove(&mut self, key: ResponseKey) -> Option<ResponseData> {
        let data = self.entries.remove(&key)?;
        self.order.retain(|k| *k != key);

        Some(data)
    }

    pub fn get(&self, key: ResponseKey) -> Option<&ResponseData> {
        self.entries.get(&key)
    }

    /// The most recently saved response.
    pub fn latest_response(&self) -> Option<&FrameAllocResponse> {
        self.order.last().and_then(|key| self.entries.get(key)).map(|data| &data.response)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, most recent first.
    pub fn drain(&mut self) -> Vec<ResponseData> {
        let mut drained = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop() {
            if let Some(data) = self.entries.remove(&key) {
                drained.push(data);
            }
        }

        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryType;
    use crate::Fourcc;

    fn entry(n: usize) -> ResponseData {
        let mids: Arc<[MemId]> = (0..n).map(|_| MemId::new()).collect();
        ResponseData {
            mids: Arc::clone(&mids),
            blocks: vec![],
            num_frames: n as u16,
            info: FrameInfo::new(Fourcc::NV12, (16, 16).into()),
            response: FrameAllocResponse {
                mids,
                num_frame_actual: n as u16,
                memory_type: MemoryType::VIDEO_MEMORY_DECODER_TARGET,
            },
        }
    }

    #[test]
    fn insert_remove() {
        let mut ledger = Ledger::default();
        let first = ledger.insert(entry(2));
        let second = ledger.insert(entry(3));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.latest_response().unwrap().key(), second);

        let removed = ledger.remove(second).unwrap();
        assert_eq!(removed.num_frames(), 3);
        assert_eq!(ledger.latest_response().unwrap().key(), first);
        assert!(ledger.remove(second).is_none());

        assert!(ledger.get(first).is_some());
        assert_eq!(ledger.drain().len(), 1);
        assert!(ledger.is_empty());
        assert!(ledger.latest_response().is_none());
    }
}
