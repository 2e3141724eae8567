//! SimpleBridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge contract.
//! The same contract is deployed on both ledgers: the source side emits
//! `Deposited`, the destination side is called through `fulfill`.

use alloy::sol;

sol! {
    /// Lock-free burn/mint bridge with a relayer allowlist
    #[sol(rpc)]
    contract SimpleBridge {
        /// Burn `amount` from the caller and announce the transfer
        ///
        /// # Arguments
        /// * `to` - Recipient on the destination ledger
        /// * `amount` - Token amount (18 decimals, may be zero)
        /// * `dstChainId` - Routing tag of the destination ledger
        /// * `depositId` - Globally unique identifier chosen by the depositor
        function deposit(address to, uint256 amount, uint256 dstChainId, bytes32 depositId) external;

        /// Mint `amount` to `to`; reverts with `AlreadyProcessed` for a known id
        /// and `NotRelayer` for a caller outside the allowlist
        function fulfill(address to, uint256 amount, bytes32 depositId) external;

        /// Whether `depositId` is in the ProcessedSet
        function isProcessed(bytes32 depositId) external view returns (bool);

        /// Relayer allowlist membership
        function relayers(address account) external view returns (bool);

        event Deposited(
            address indexed from,
            address indexed to,
            uint256 amount,
            uint256 dstChainId,
            bytes32 indexed depositId
        );

        event Fulfilled(address indexed to, uint256 amount, bytes32 indexed depositId);

        event RelayerUpdated(address indexed relayer, bool allowed);
    }
}
