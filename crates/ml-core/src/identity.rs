use crate::pose::{BoundingBox, ImageView};

/// Label used when no identity could be established.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Face-similarity matching against a gallery of known people.
pub trait IdentityMatcher: Send {
    /// Name of the best gallery match for the face inside `face`, if any
    /// match is close enough.
    fn identify(&mut self, image: &ImageView<'_>, face: BoundingBox) -> Option<String>;
}

impl<T: IdentityMatcher + ?Sized> IdentityMatcher for Box<T> {
    fn identify(&mut self, image: &ImageView<'_>, face: BoundingBox) -> Option<String> {
        (**self).identify(image, face)
    }
}
