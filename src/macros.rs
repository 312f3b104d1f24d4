// One invocation per kind: generates the kind test and the checked typed
// views on the generic handle, together with the wrapper-side road back.
// Conversions in both directions funnel through the single kind test, so
// a wrapper can only ever be produced for a matching header.
macro_rules! value_kind {
    ($t:ty = $kind:path; $is:ident, $as_ref:ident, $as_mut:ident, $into:ident) => {
        impl crate::OValue {
            /// Returns `true` if this value is of the corresponding kind.
            #[must_use]
            pub fn $is(&self) -> bool {
                self.kind() == $kind
            }

            /// Borrows the kind-specific wrapper if the kind matches.
            #[must_use]
            pub fn $as_ref(&self) -> Option<&$t> {
                if self.$is() {
                    // Safety: the wrapper is a `#[repr(transparent)]` OValue
                    Some(unsafe { self.unchecked_cast_ref() })
                } else {
                    None
                }
            }

            /// Mutably borrows the kind-specific wrapper if the kind matches.
            pub fn $as_mut(&mut self) -> Option<&mut $t> {
                if self.$is() {
                    // Safety: the wrapper is a `#[repr(transparent)]` OValue
                    Some(unsafe { self.unchecked_cast_mut() })
                } else {
                    None
                }
            }

            /// Converts into the kind-specific wrapper.
            ///
            /// # Errors
            ///
            /// Returns `Err(self)` if the kind does not match.
            pub fn $into(self) -> Result<$t, crate::OValue> {
                if self.$is() {
                    Ok(<$t>::from_value(self))
                } else {
                    Err(self)
                }
            }
        }

        impl $t {
            /// Gives up the typed view, keeping the reference.
            #[must_use]
            pub fn into_value(self) -> crate::OValue {
                self.0
            }

            /// The generic handle backing this wrapper.
            #[must_use]
            pub fn as_value(&self) -> &crate::OValue {
                &self.0
            }
        }

        impl std::convert::AsRef<crate::OValue> for $t {
            fn as_ref(&self) -> &crate::OValue {
                self.as_value()
            }
        }

        impl From<$t> for crate::OValue {
            fn from(wrapper: $t) -> crate::OValue {
                wrapper.into_value()
            }
        }

        impl std::convert::TryFrom<crate::OValue> for $t {
            type Error = crate::OValue;
            fn try_from(value: crate::OValue) -> Result<$t, crate::OValue> {
                value.$into()
            }
        }
    };
}
