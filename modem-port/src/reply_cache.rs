use std::collections::HashMap;

/// Last successful reply per exact command byte sequence.
#[derive(Debug, Default)]
pub(crate) struct ReplyCache {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl ReplyCache {
    pub fn get(&self, command: &[u8]) -> Option<&[u8]> {
        self.entries.get(command).map(Vec::as_slice)
    }

    pub fn insert(&mut self, command: &[u8], reply: &[u8]) {
        self.entries.insert(command.to_vec(), reply.to_vec());
    }

    pub fn evict(&mut self, command: &[u8]) {
        self.entries.remove(command);
    }
}
