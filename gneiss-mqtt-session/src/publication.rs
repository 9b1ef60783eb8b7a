/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Shared, immutable topic and payload storage for publishes.

A single [`Publication`] is referenced by every in-flight record that carries the same
content.  Storage is released when the last handle is dropped; the reference count is updated
atomically, so handles may be shared and released from the worker and application threads
concurrently.
 */

use std::fmt;
use std::sync::Arc;
#[cfg(test)]
use std::sync::Weak;

struct PublicationData {
    topic: String,
    payload: Vec<u8>,
    mask: [u8; 4],
}

/// Reference-counted handle to an immutable topic and payload.
///
/// The 4-byte mask is carried opaquely for the transport layer (websocket framing, obfuscation
/// at rest); the payload is never transformed by this type.
#[derive(Clone)]
pub struct Publication {
    data: Arc<PublicationData>,
}

impl Publication {

    /// Creates a new publication with a reference count of 1 and an all-zero mask.
    pub fn acquire(topic: &str, payload: Vec<u8>) -> Self {
        Publication::acquire_with_mask(topic, payload, [0; 4])
    }

    /// Creates a new publication with a reference count of 1 and the supplied mask.
    pub fn acquire_with_mask(topic: &str, payload: Vec<u8>, mask: [u8; 4]) -> Self {
        Publication {
            data: Arc::new(PublicationData {
                topic: topic.to_string(),
                payload,
                mask,
            })
        }
    }

    /// Returns a new handle to the same storage, incrementing the reference count.
    pub fn share(&self) -> Publication {
        self.clone()
    }

    /// Releases this handle.  Storage is freed when the last handle is released.
    pub fn release(self) {
        drop(self);
    }

    /// Topic the content was (or will be) published to.
    pub fn topic(&self) -> &str {
        self.data.topic.as_str()
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.data.payload.as_slice()
    }

    /// Transport mask associated with the payload.
    pub fn mask(&self) -> [u8; 4] {
        self.data.mask
    }

    /// Current number of live handles to this publication's storage.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Returns true if both handles refer to the same storage.
    pub fn ptr_eq(first: &Publication, second: &Publication) -> bool {
        Arc::ptr_eq(&first.data, &second.data)
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> PublicationTracker {
        PublicationTracker {
            data: Arc::downgrade(&self.data)
        }
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Publication {{ topic:\"{}\" payload:<{} Bytes> references:{} }}", self.topic(), self.payload().len(), self.reference_count())
    }
}

/// Observes a publication's storage without keeping it alive.
#[cfg(test)]
pub(crate) struct PublicationTracker {
    data: Weak<PublicationData>,
}

#[cfg(test)]
impl PublicationTracker {
    pub(crate) fn is_freed(&self) -> bool {
        self.data.strong_count() == 0
    }

    pub(crate) fn reference_count(&self) -> usize {
        self.data.strong_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_starts_with_single_reference() {
        let publication = Publication::acquire("hello/world", "hello".as_bytes().to_vec());

        assert_eq!(1, publication.reference_count());
        assert_eq!("hello/world", publication.topic());
        assert_eq!("hello".as_bytes(), publication.payload());
        assert_eq!([0u8; 4], publication.mask());
    }

    #[test]
    fn share_and_release_track_reference_count() {
        let publication = Publication::acquire("a/b", vec![1, 2, 3]);
        let tracker = publication.tracker();

        let shared1 = publication.share();
        let shared2 = shared1.share();
        assert_eq!(3, tracker.reference_count());
        assert!(Publication::ptr_eq(&publication, &shared2));

        shared1.release();
        assert_eq!(2, tracker.reference_count());
        assert!(!tracker.is_freed());

        publication.release();
        assert!(!tracker.is_freed());
        assert_eq!(&[1u8, 2, 3], shared2.payload());

        shared2.release();
        assert!(tracker.is_freed());
    }

    #[test]
    fn freed_only_when_releases_match_acquires_and_shares() {
        for share_count in 0..8 {
            let publication = Publication::acquire("fan/out", vec![0; 16]);
            let tracker = publication.tracker();

            let mut handles : Vec<Publication> = (0..share_count).map(|_| publication.share()).collect();
            handles.push(publication);

            while let Some(handle) = handles.pop() {
                assert!(!tracker.is_freed());
                handle.release();
            }

            assert!(tracker.is_freed());
        }
    }

    #[test]
    fn mask_is_preserved_opaquely() {
        let publication = Publication::acquire_with_mask("masked", vec![5, 6], [1, 2, 3, 4]);
        let shared = publication.share();

        assert_eq!([1, 2, 3, 4], shared.mask());
        assert_eq!(&[5u8, 6], shared.payload());
    }

    #[test]
    fn concurrent_share_and_release() {
        let publication = Publication::acquire("threads", vec![7; 64]);
        let tracker = publication.tracker();

        let workers : Vec<std::thread::JoinHandle<()>> = (0..4).map(|_| {
            let handle = publication.share();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let extra = handle.share();
                    assert!(extra.reference_count() >= 2);
                    extra.release();
                }
                handle.release();
            })
        }).collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(1, tracker.reference_count());
        publication.release();
        assert!(tracker.is_freed());
    }
}
