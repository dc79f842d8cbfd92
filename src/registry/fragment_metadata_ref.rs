use std::{ops::Deref, sync::Arc};

use crate::fragment::{FragmentId, FragmentMetadata};

use super::{OpenArray, Registry};

/// A counted reference to cached fragment metadata.
///
/// Dropping the reference releases it.
/// When the last reference to an entry is released the entry is freed (or retained for reuse, see [`Config::registry_fragment_metadata_retention`](crate::config::Config::registry_fragment_metadata_retention)).
/// Metadata invalidated while referenced stays readable through existing references and is freed when the last is released.
#[derive(Debug)]
pub struct FragmentMetadataRef {
    registry: Registry,
    array: Arc<OpenArray>,
    fragment: FragmentId,
    generation: u64,
    metadata: Arc<FragmentMetadata>,
}

impl FragmentMetadataRef {
    pub(super) fn new(
        registry: Registry,
        array: Arc<OpenArray>,
        fragment: FragmentId,
        generation: u64,
        metadata: Arc<FragmentMetadata>,
    ) -> Self {
        Self {
            registry,
            array,
            fragment,
            generation,
            metadata,
        }
    }

    /// Return the fragment id.
    #[must_use]
    pub fn fragment(&self) -> &FragmentId {
        &self.fragment
    }

    /// Release the reference. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Deref for FragmentMetadataRef {
    type Target = FragmentMetadata;

    fn deref(&self) -> &Self::Target {
        &self.metadata
    }
}

impl Drop for FragmentMetadataRef {
    fn drop(&mut self) {
        let mut state = self.array.state.lock();
        match state.slots.get_mut(&self.fragment) {
            Some(slot) if slot.generation == self.generation => {
                slot.refs -= 1;
                if slot.refs == 0 {
                    if let Some(slot) = state.slots.remove(&self.fragment) {
                        let open = state.open_count > 0;
                        if let (true, Some(idle)) = (open, state.idle.as_mut()) {
                            idle.put(self.fragment, slot.metadata);
                        }
                    }
                }
            }
            _ => state.retired_refs = state.retired_refs.saturating_sub(1),
        }
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.registry.remove_if_idle(&self.array);
        }
    }
}
