//! Subcommand implementations

use colored::Colorize;
use eyre::WrapErr;
use nexum_ccid_core::atr::tables;
use nexum_ccid_core::message::{Reply, ReplyBody, Request, SlotStatus, decode_request_header};
use nexum_ccid_core::params::{self, ProtocolParams};
use nexum_ccid_core::pps::{self, PpsResponse};
use nexum_ccid_core::t1::Block;
use nexum_ccid_core::{AtrRecord, Bytes, Protocol, ReaderCapabilities, ReaderConfig};
use tracing::debug;

use crate::PpsAnswer;
use crate::display::*;

fn parse_atr(input: &str) -> eyre::Result<AtrRecord> {
    let bytes = parse_hex(input)?;
    AtrRecord::parse(&bytes).wrap_err("Failed to parse ATR")
}

/// Decode and describe an ATR
pub fn atr_command(input: &str) -> eyre::Result<()> {
    let atr = parse_atr(input)?;

    println!(
        "{}",
        key_value_box(
            "Answer to Reset",
            vec![
                ("Bytes", hex_bytes(&atr.to_bytes())),
                ("Convention", atr.convention().to_string()),
                ("Protocols", atr.supported_protocols().to_string()),
                ("Default protocol", optional(atr.default_protocol())),
                (
                    "Mode",
                    if atr.params_negotiable() {
                        "negotiable".to_string()
                    } else {
                        "specific".to_string()
                    }
                ),
                ("Historical bytes", hex_bytes(atr.historical_bytes())),
                ("TCK", optional(atr.checksum().map(|c| format!("{c:02X}")))),
            ],
        )
    );

    println!("{}", section_title("Transmission"));
    println!(
        "  Fi/Di: {:X}{:X} (Fi {}, Di {}, max {} Hz){}",
        atr.fi_index(),
        atr.di_index(),
        optional(atr.fi_value()),
        optional(atr.di_value()),
        optional(atr.max_clock_hz()),
        if tables::fi_di_valid(atr.fi_index(), atr.di_index()) {
            String::new()
        } else {
            format!(" {}", "reserved".red())
        }
    );
    println!("  Extra guard time: {}", atr.extra_guard_time());
    println!("  Clock stop: {}", atr.clock_stop());

    let protocols = atr.supported_protocols();
    if protocols.contains(Protocol::T0) {
        println!("{}", section_title("T=0"));
        println!("  WI: {}", atr.t0_wi());
    }
    if protocols.contains(Protocol::T1) {
        println!("{}", section_title("T=1"));
        println!("  IFSC: {}", atr.t1_ifsc());
        println!("  BWI: {}, CWI: {}", atr.t1_bwi(), atr.t1_cwi());
        println!("  Checksum: {}", atr.t1_checksum());
    }

    println!("{}", section_title("Interface groups"));
    for (index, group) in atr.groups().iter().enumerate() {
        println!(
            "  {}: T={} TA={} TB={} TC={}",
            index + 1,
            group.protocol,
            optional(group.ta.map(|b| format!("{b:02X}"))),
            optional(group.tb.map(|b| format!("{b:02X}"))),
            optional(group.tc.map(|b| format!("{b:02X}"))),
        );
    }

    Ok(())
}

/// Show the negotiation plan without talking to anything
pub fn plan_command(input: &str, caps: &ReaderCapabilities, config: &ReaderConfig) -> eyre::Result<()> {
    let atr = parse_atr(input)?;
    let plan = params::plan(&atr, caps, config).wrap_err("No way to operate this card")?;

    println!(
        "{}",
        key_value_box(
            "Negotiation plan",
            vec![
                ("Reader", format!("{} ({})", caps.protocols, caps.features.exchange_level())),
                ("Common protocols", plan.common.to_string()),
                ("Target protocol", plan.target.to_string()),
                ("Fi/Di", format!("{:02X}", plan.fi_di)),
                (
                    "PPS",
                    plan.pps
                        .map_or_else(|| "not sent".to_string(), |r| hex_bytes(&r.to_bytes())),
                ),
                ("SetParameters", plan.program.to_string()),
            ],
        )
    );

    let parameters = plan.parameters(&atr, caps, plan.fi_di);
    println!("{}", section_title("Parameters"));
    print_parameters(&parameters);
    Ok(())
}

/// Run negotiation against an in-process card that answers as configured
pub fn negotiate_command(
    input: &str,
    answer: PpsAnswer,
    caps: &ReaderCapabilities,
    config: &ReaderConfig,
) -> eyre::Result<()> {
    let atr = parse_atr(input)?;
    let mut programmed: Option<(u8, Bytes)> = None;

    let mut channel = |request: Request| -> nexum_ccid_core::Result<Reply> {
        let encoded = request.encode(0, 0);
        debug!(command = request.name(), message = %hex::encode(&encoded), "Simulated command");
        let (_, _, _, specific, payload) = decode_request_header(&encoded)?;

        let body = match request {
            Request::XfrBlock { data, .. } => {
                let response = simulate_pps(&data, answer);
                println!("  PPS {} -> {}", hex_bytes(&data), hex_bytes(&response));
                ReplyBody::DataBlock {
                    chain: 0,
                    data: Bytes::from(response),
                }
            }
            Request::SetParameters(block) => {
                println!("  SetParameters {block:?}");
                programmed = Some((specific[0], payload.clone()));
                ReplyBody::Parameters {
                    protocol: specific[0],
                    data: payload,
                }
            }
            Request::GetParameters => {
                let (protocol, data) = programmed
                    .clone()
                    .unwrap_or((0, Bytes::from_static(&[0x11, 0x00, 0x00, 0x0A, 0x00])));
                ReplyBody::Parameters { protocol, data }
            }
            _ => ReplyBody::SlotStatus { clock: 0 },
        };
        Ok(Reply {
            slot: 0,
            seq: 0,
            status: SlotStatus::from_bytes(0, 0),
            body,
        })
    };

    println!("{}", section_title("Exchange"));
    match params::negotiate(&atr, caps, config, &mut channel) {
        Ok(parameters) => {
            println!("{}", section_title("Operating parameters"));
            print_parameters(&parameters);
            println!("\n{}", success("Card is ready"));
        }
        Err(e) => {
            println!("\n{}", warning(&format!("Negotiation failed: {e}")));
        }
    }
    Ok(())
}

fn simulate_pps(request: &[u8], answer: PpsAnswer) -> Vec<u8> {
    let mut response = match (answer, request) {
        (PpsAnswer::Decline, [ppss, pps0, ..]) => vec![*ppss, pps0 & 0x0F],
        (PpsAnswer::Defaults, [ppss, pps0, _, ..]) if pps0 & 0x10 != 0 => {
            vec![*ppss, *pps0, pps::DEFAULT_FI_DI]
        }
        _ => return request.to_vec(),
    };
    response.push(response.iter().fold(0, |acc, b| acc ^ b));
    response
}

fn print_parameters(parameters: &params::OperatingParameters) {
    println!("  Protocol: {}", parameters.protocol);
    println!(
        "  Fi/Di: {:02X}, guard time {}, {} convention",
        parameters.fi_di(),
        parameters.guard_time,
        parameters.convention
    );
    println!("  Clock stop: {}", parameters.clock_stop);
    match parameters.protocol_params {
        ProtocolParams::T0 { wi } => println!("  WI: {wi}"),
        ProtocolParams::T1 {
            bwi,
            cwi,
            ifsc,
            checksum,
        } => println!("  BWI {bwi}, CWI {cwi}, IFSC {ifsc}, {checksum}"),
    }
}

/// Decode a PPS message
pub fn pps_command(input: &str) -> eyre::Result<()> {
    let bytes = parse_hex(input)?;
    let pps = PpsResponse::parse(&bytes).wrap_err("Failed to parse PPS")?;
    println!(
        "{}",
        key_value_box(
            "PPS",
            vec![
                ("Protocol", format!("T={}", pps.protocol)),
                ("PPS1 (Fi/Di)", optional(pps.pps1.map(|b| format!("{b:02X}")))),
                ("PPS2", optional(pps.pps2.map(|b| format!("{b:02X}")))),
                ("PPS3", optional(pps.pps3.map(|b| format!("{b:02X}")))),
            ],
        )
    );
    Ok(())
}

/// Decode a T=1 block
pub fn block_command(input: &str) -> eyre::Result<()> {
    let bytes = parse_hex(input)?;
    let block = Block::decode(&bytes).wrap_err("Failed to decode T=1 block")?;
    let description = match &block {
        Block::Information { seq, more, data } => format!(
            "I-block N(S)={seq}{} INF {}",
            if *more { " M" } else { "" },
            hex_bytes(data)
        ),
        Block::ReceiveReady { seq, status } => format!("R-block N(R)={seq} {status:?}"),
        Block::Supervisory {
            kind,
            response,
            data,
        } => format!(
            "S({kind:?} {}) {}",
            if *response { "response" } else { "request" },
            hex_bytes(data)
        ),
    };
    println!("{}", success(&description));
    Ok(())
}

/// Decode a reply message
pub fn reply_command(input: &str) -> eyre::Result<()> {
    let bytes = parse_hex(input)?;
    let reply = Reply::decode(&bytes).wrap_err("Failed to decode reply")?;

    let body = match &reply.body {
        ReplyBody::DataBlock { chain, data } => format!("data block (chain {chain}) {}", hex_bytes(data)),
        ReplyBody::SlotStatus { clock } => format!("slot status (clock {clock})"),
        ReplyBody::Parameters { protocol, data } => {
            format!("parameters T={protocol} {}", hex_bytes(data))
        }
    };
    println!(
        "{}",
        key_value_box(
            "Reply",
            vec![
                ("Slot", reply.slot.to_string()),
                ("Sequence", reply.seq.to_string()),
                ("Card", format!("{:?}", reply.status.icc)),
                ("Command", format!("{:?}", reply.status.command)),
                ("Body", body),
            ],
        )
    );

    if let Err(e) = reply.into_result() {
        println!("{}", warning(&e.to_string()));
    }
    Ok(())
}
