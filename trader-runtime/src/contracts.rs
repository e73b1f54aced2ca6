//! Shared Solidity contract bindings for all on-chain interactions.
//!
//! Uses alloy's `sol!` macro to generate type-safe ABI encoders/decoders
//! for the staking system contracts. Staking proxies forward every call to
//! their implementation, so a single interface covers both deployments.

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface IStakingToken {
        function getServiceStakingState(uint256 serviceId) external view returns (uint8 state);
        function availableRewards() external view returns (uint256);
        function maxNumServices() external view returns (uint256);
        function getServiceIds() external view returns (uint256[] memory);
        function getNextRewardCheckpointTimestamp() external view returns (uint256);
        function livenessPeriod() external view returns (uint256);
        function minStakingDuration() external view returns (uint256);
        function mapServiceInfo(uint256 serviceId) external view returns (
            address multisig,
            address owner,
            uint256[] memory nonces,
            uint256 tsStart,
            uint256 reward,
            uint256 inactivity
        );

        function stake(uint256 serviceId) external;
        function unstake(uint256 serviceId) external;
        function claim(uint256 serviceId) external;

        function metadataHash() external view returns (bytes32);
        function agentIds(uint256 index) external view returns (uint256);
        function serviceRegistry() external view returns (address);
        function serviceRegistryTokenUtility() external view returns (address);
        function stakingToken() external view returns (address);
        function minStakingDeposit() external view returns (uint256);
        function activityChecker() external view returns (address);
        function agentMech() external view returns (address);
    }

    // Approval shares the ERC-721 shape, so the same interface covers both
    // the OLAS bond token and the service-registry NFT.
    #[sol(rpc)]
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
    }

    #[sol(rpc)]
    interface IActivityChecker {
        function agentMech() external view returns (address);
    }

    #[sol(rpc)]
    interface IAgentMech {
        event Request(address indexed sender, uint256 requestId, bytes data);
        event Deliver(address indexed sender, uint256 requestId, bytes data);
    }
}
