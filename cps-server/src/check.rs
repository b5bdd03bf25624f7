//! `check` subcommand: inspect a community contract and its members.
//!
//! Prints what the chain and the Streamr API know about one community, so an
//! operator can tell whether a community is set up correctly before (or
//! while) the server runs it. Any failure ends the command with an error.

use anyhow::{Context, bail};
use clap::builder::FalseyValueParser;
use cps_core::chain::ChainReader;
use cps_core::chain::rpc::{DEFAULT_POLL_INTERVAL, RpcChain};
use cps_sdk::Address;
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;
use url::Url;

#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    /// Ethereum JSON-RPC endpoint
    #[arg(long, env = "ETHEREUM_SERVER")]
    pub rpc_url: Url,

    /// Community contract to inspect
    #[arg(long, env = "COMMUNITY_ADDRESS")]
    pub community: Address,

    /// Streamr HTTP API serving the member list
    #[arg(long, env = "STREAMR_HTTP_URL", default_value = "https://streamr.com/api/v1")]
    pub streamr_http_url: Url,

    /// Suppress the report; only the exit status tells the result
    #[arg(long, env = "QUIET", value_parser = FalseyValueParser::new())]
    pub quiet: bool,
}

/// One entry of the Streamr member list.
#[derive(Debug, Deserialize)]
struct Member {
    address: Address,
    /// Decimal string or number, depending on the API version.
    earnings: Value,
}

pub async fn run(args: &CheckArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let chain = RpcChain::new(args.rpc_url.clone(), DEFAULT_POLL_INTERVAL);

    writeln!(out, "Connecting to {}", chain.url())?;
    let chain_id = chain.chain_id().await.context("eth_chainId")?;
    let block = chain.block_number().await.context("eth_blockNumber")?;
    writeln!(out, "Network: chain id {chain_id}, block height {block}")?;

    ensure_contract(&chain, args.community, "COMMUNITY_ADDRESS").await?;
    writeln!(out, "Checking community contract at {}...", args.community)?;
    let operator = chain.operator(args.community).await.context("operator()")?;
    writeln!(out, "  operator: {operator}")?;
    let stream = chain
        .join_part_stream(args.community)
        .await
        .context("joinPartStream()")?;
    writeln!(out, "  joinPartStream: {stream}")?;
    let token = chain.token(args.community).await.context("token()")?;
    writeln!(out, "  token: {token}")?;

    ensure_contract(&chain, token, &format!("community({}).token", args.community)).await?;
    writeln!(out, "Checking token contract at {token}...")?;
    let metadata = chain.token_metadata(token).await.context("token metadata")?;
    writeln!(out, "  Token name: {}", metadata.name)?;
    writeln!(out, "  Token symbol: {}", metadata.symbol)?;
    writeln!(out, "  Token decimals: {}", metadata.decimals)?;

    writeln!(out, "Listing all members...")?;
    for member in fetch_members(&args.streamr_http_url, args.community).await? {
        let withdrawn = chain
            .withdrawn(args.community, member.address)
            .await
            .with_context(|| format!("withdrawn({})", member.address))?;
        writeln!(out, "  {}", member.address)?;
        writeln!(out, "    Server: Total earnings: {}", display_amount(&member.earnings))?;
        writeln!(out, "    Contract: Withdrawn earnings: {withdrawn}")?;
    }

    Ok(())
}

async fn ensure_contract(chain: &RpcChain, address: Address, what: &str) -> anyhow::Result<()> {
    let code = chain
        .code_at(address)
        .await
        .with_context(|| format!("eth_getCode {address}"))?;
    if code.is_empty() {
        bail!("{what}: no contract at {address}");
    }
    Ok(())
}

fn members_url(streamr_http_url: &Url, community: Address) -> String {
    format!(
        "{}/communities/{community}/members",
        streamr_http_url.as_str().trim_end_matches('/')
    )
}

async fn fetch_members(streamr_http_url: &Url, community: Address) -> anyhow::Result<Vec<Member>> {
    let url = members_url(streamr_http_url, community);
    let members = reqwest::get(&url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .with_context(|| format!("GET {url}"))?
        .json()
        .await
        .with_context(|| format!("member list from {url}"))?;
    Ok(members)
}

fn display_amount(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
