//! Code generation and allocation errors.

/// Reasons a `pdma` operation can fail.
///
/// Every fallible step in this crate reports one of these in-band. There is
/// no internal retry: callers decide whether to retry later, reshape the
/// transfer, or surface the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No free channel or event line remains in the pool.
    ///
    /// Recoverable: release a resource and retry, or reject the request
    /// upstream.
    Exhausted,
    /// The generated program does not fit the channel's microcode buffer.
    ///
    /// The requested transfer shape (length, burst geometry, or double
    /// buffering) exceeds this channel's capacity. Split the transfer;
    /// retrying unchanged will fail again.
    Overflow,
    /// A loop's backward branch distance exceeds the encodable range.
    ///
    /// Same remediation as [`Overflow`](Error::Overflow): the transfer
    /// needs a smaller shape, not a retry.
    BranchRange,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Exhausted => f.write_str("no free channel or event line"),
            Error::Overflow => f.write_str("program exceeds the microcode buffer capacity"),
            Error::BranchRange => f.write_str("backward branch exceeds the encodable range"),
        }
    }
}
