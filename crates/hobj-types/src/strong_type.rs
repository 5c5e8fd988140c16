/// Macro to create a strongly-typed newtype wrapper around an integer id.
///
/// The generated type implements:
/// - `Deref` to the inner type
/// - `From<inner>` and `Into<inner>`
/// - `Display` (bare value), `Debug` (`Name(value)`)
/// - `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`, `Default`
/// - `serde::Serialize` and `serde::Deserialize` (transparent)
/// - `as_usize()` for indexing into dense tables
///
/// Outer attributes (doc comments) written before the name are forwarded to
/// the generated struct.
#[macro_export]
macro_rules! strong_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Widen the id for use as a vector index.
            #[inline]
            pub fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    strong_type!(
        /// Test-only id.
        SlotId,
        u16
    );

    #[test]
    fn test_deref_and_conversions() {
        let id: SlotId = 9u16.into();
        assert_eq!(*id, 9);
        let raw: u16 = id.into();
        assert_eq!(raw, 9);
        assert_eq!(id.as_usize(), 9usize);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(SlotId(3).to_string(), "3");
        assert_eq!(format!("{:?}", SlotId(3)), "SlotId(3)");
    }

    #[test]
    fn test_ordering_follows_inner() {
        let set: BTreeSet<SlotId> = [SlotId(5), SlotId(1), SlotId(3)].into_iter().collect();
        let ordered: Vec<u16> = set.into_iter().map(u16::from).collect();
        assert_eq!(ordered, vec![1, 3, 5]);
        assert_eq!(SlotId::default(), SlotId(0));
    }
}
