// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire definitions for the subset of the gossip protocol the router speaks: channel and node
//! announcements, channel updates, and the channel range query dialogue with its timestamp and
//! checksum extensions.
//!
//! Messages are encoded big-endian in declaration order. The optional query extensions ride in
//! trailing type-length-value records so that the same structs cover the plain, timestamp and
//! checksum flavors of the sync dialogue; an absent record simply leaves the field `None`.

use bitcoin::secp256k1::{self, Message, PublicKey, Secp256k1};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::constants::PUBLIC_KEY_SIZE;
use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256d::Hash as Sha256dHash;
use bitcoin::hash_types::BlockHash;

use crate::util::logger::Level;
use crate::util::ser::{BigSize, Readable, VecWriter, Writeable, Writer};

use std::fmt;
use std::io::{self, Read};

/// Bit set in [`QueryChannelRange::query_flags`] to ask the peer to include per-channel update
/// timestamps in its replies.
pub const QUERY_FLAG_TIMESTAMPS: u8 = 1;
/// Bit set in [`QueryChannelRange::query_flags`] to ask the peer to include per-channel update
/// checksums in its replies.
pub const QUERY_FLAG_CHECKSUMS: u8 = 2;

/// Per-id flag in [`QueryShortChannelIds::query_flags`]: send us the channel announcement.
pub const SCID_QUERY_FLAG_ANNOUNCEMENT: u8 = 1;
/// Per-id flag in [`QueryShortChannelIds::query_flags`]: send us the update from node 1.
pub const SCID_QUERY_FLAG_UPDATE_1: u8 = 2;
/// Per-id flag in [`QueryShortChannelIds::query_flags`]: send us the update from node 2.
pub const SCID_QUERY_FLAG_UPDATE_2: u8 = 4;

/// Represents the compressed public key of a node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; PUBLIC_KEY_SIZE]);

impl NodeId {
	/// Create a new NodeId from a public key
	pub fn from_pubkey(pubkey: &PublicKey) -> Self {
		NodeId(pubkey.serialize())
	}

	/// Create a new NodeId from a slice of bytes
	pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
		if bytes.len() != PUBLIC_KEY_SIZE {
			return Err(DecodeError::InvalidValue);
		}
		let mut data = [0; PUBLIC_KEY_SIZE];
		data.copy_from_slice(bytes);
		Ok(NodeId(data))
	}

	/// Get the public key slice from this NodeId
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Get the public key from this NodeId
	pub fn as_pubkey(&self) -> Result<PublicKey, secp256k1::Error> {
		PublicKey::from_slice(&self.0)
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({})", log_bytes!(self.0))
	}
}
impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", log_bytes!(self.0))
	}
}

impl Writeable for NodeId {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self.0)
	}
}

impl Readable for NodeId {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; PUBLIC_KEY_SIZE];
		reader.read_exact(&mut buf)?;
		Ok(Self(buf))
	}
}

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// Includes stuff we expected to parse but failed on, e.g. a bogus public key
	InvalidValue,
	/// A required extension record used a type we don't know
	UnknownRequiredFeature,
	/// Buffer too short
	ShortRead,
	/// A length descriptor in the message didn't describe the later data correctly
	BadLengthDescriptor,
	/// The message used a compressed id encoding we do not support
	UnsupportedEncoding,
	/// Error from std::io
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::UnknownRequiredFeature => f.write_str("Unknown required extension record in message"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::BadLengthDescriptor => f.write_str("A length descriptor in the packet didn't describe the later data correctly"),
			DecodeError::UnsupportedEncoding => f.write_str("Unsupported short channel id encoding"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// The action to take when a message fails to process, as reported in a [`LightningError`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorAction {
	/// The peer did something harmless that we weren't able to process, just log and ignore
	IgnoreError,
	/// The peer did something harmless that we weren't able to meaningfully process.
	/// If the error is logged, log it at the given level.
	IgnoreAndLog(Level),
	/// The peer provided us with a gossip message which we'd already seen. In most cases this
	/// should be ignored without logging.
	IgnoreDuplicateGossip,
	/// The message carried an invalid signature; the origin should be notified so it can take
	/// action against the misbehaving peer.
	SendInvalidSignature,
}

/// An Err type for failure to process messages.
#[derive(Clone, Debug)]
pub struct LightningError {
	/// A human-readable message describing the error
	pub err: String,
	/// The action which should be taken against the offending peer.
	pub action: ErrorAction,
}

/// Fees for routing via a given channel or a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RoutingFees {
	/// Flat routing fee in satoshis
	pub base_msat: u32,
	/// Liquidity-based routing fee in millionths of a routed amount.
	/// In other words, 10000 is 1%.
	pub proportional_millionths: u32,
}

impl Writeable for RoutingFees {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.base_msat.write(writer)?;
		self.proportional_millionths.write(writer)
	}
}

impl Readable for RoutingFees {
	fn read<R: Read>(reader: &mut R) -> Result<RoutingFees, DecodeError> {
		Ok(RoutingFees {
			base_msat: Readable::read(reader)?,
			proportional_millionths: Readable::read(reader)?,
		})
	}
}

/// An address which can be used to connect to a remote peer
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetAddress {
	/// An IPv4 address/port on which the peer is listening.
	IPv4 {
		/// The 4-byte IPv4 address
		addr: [u8; 4],
		/// The port on which the node is listening
		port: u16,
	},
	/// An IPv6 address/port on which the peer is listening.
	IPv6 {
		/// The 16-byte IPv6 address
		addr: [u8; 16],
		/// The port on which the node is listening
		port: u16,
	},
	/// A new-style Tor onion address/port on which the peer is listening.
	OnionV3 {
		/// The ed25519 long-term public key of the peer
		ed25519_pubkey: [u8; 32],
		/// The checksum of the pubkey and version, as included in the onion address
		checksum: u16,
		/// The version byte, as defined by the Tor Onion v3 spec.
		version: u8,
		/// The port on which the node is listening
		port: u16,
	},
}
impl Writeable for NetAddress {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		match self {
			&NetAddress::IPv4 { ref addr, ref port } => {
				1u8.write(writer)?;
				addr.write(writer)?;
				port.write(writer)?;
			},
			&NetAddress::IPv6 { ref addr, ref port } => {
				2u8.write(writer)?;
				addr.write(writer)?;
				port.write(writer)?;
			},
			&NetAddress::OnionV3 { ref ed25519_pubkey, ref checksum, ref version, ref port } => {
				4u8.write(writer)?;
				ed25519_pubkey.write(writer)?;
				checksum.write(writer)?;
				version.write(writer)?;
				port.write(writer)?;
			},
		}
		Ok(())
	}
}

impl Readable for Result<NetAddress, u8> {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let byte = <u8 as Readable>::read(reader)?;
		match byte {
			1 => {
				Ok(Ok(NetAddress::IPv4 {
					addr: Readable::read(reader)?,
					port: Readable::read(reader)?,
				}))
			},
			2 => {
				Ok(Ok(NetAddress::IPv6 {
					addr: Readable::read(reader)?,
					port: Readable::read(reader)?,
				}))
			},
			4 => {
				Ok(Ok(NetAddress::OnionV3 {
					ed25519_pubkey: Readable::read(reader)?,
					checksum: Readable::read(reader)?,
					version: Readable::read(reader)?,
					port: Readable::read(reader)?,
				}))
			},
			_ => Ok(Err(byte)),
		}
	}
}

/// The unsigned part of a node_announcement
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnsignedNodeAnnouncement {
	/// The advertised features
	pub features: Vec<u8>,
	/// A strictly monotonic announcement counter, with gaps allowed
	pub timestamp: u32,
	/// The node_id this announcement originated from
	pub node_id: NodeId,
	/// An RGB color for UI purposes
	pub rgb: [u8; 3],
	/// An alias, for UI purposes. This should be sanitized before use. There is no guarantee
	/// of uniqueness.
	pub alias: [u8; 32],
	/// List of addresses on which this node is reachable
	pub addresses: Vec<NetAddress>,
}

/// A node_announcement message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAnnouncement {
	/// The signature by the node itself
	pub signature: Signature,
	/// The actual content of the announcement
	pub contents: UnsignedNodeAnnouncement,
}

impl std::hash::Hash for NodeAnnouncement {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.signature.serialize_compact().hash(state);
		self.contents.hash(state);
	}
}

impl Writeable for UnsignedNodeAnnouncement {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.features.write(writer)?;
		self.timestamp.write(writer)?;
		self.node_id.write(writer)?;
		self.rgb.write(writer)?;
		self.alias.write(writer)?;
		let mut addr_bytes = VecWriter(Vec::new());
		for addr in self.addresses.iter() {
			addr.write(&mut addr_bytes)?;
		}
		addr_bytes.0.write(writer)
	}
}

impl Readable for UnsignedNodeAnnouncement {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let features: Vec<u8> = Readable::read(reader)?;
		let timestamp: u32 = Readable::read(reader)?;
		let node_id: NodeId = Readable::read(reader)?;
		let rgb: [u8; 3] = Readable::read(reader)?;
		let alias: [u8; 32] = Readable::read(reader)?;
		let addr_bytes: Vec<u8> = Readable::read(reader)?;
		let mut addresses = Vec::new();
		let mut addr_reader = &addr_bytes[..];
		while !addr_reader.is_empty() {
			let addr: Result<NetAddress, u8> = Readable::read(&mut addr_reader)?;
			match addr {
				Ok(addr) => addresses.push(addr),
				// Unknown descriptor: addresses are sorted by type, nothing left we understand
				Err(_) => break,
			}
		}
		Ok(UnsignedNodeAnnouncement { features, timestamp, node_id, rgb, alias, addresses })
	}
}

impl Writeable for NodeAnnouncement {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.signature.write(writer)?;
		self.contents.write(writer)
	}
}

impl Readable for NodeAnnouncement {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(NodeAnnouncement {
			signature: Readable::read(reader)?,
			contents: Readable::read(reader)?,
		})
	}
}

/// The unsigned part of a channel_announcement
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnsignedChannelAnnouncement {
	/// The advertised channel features
	pub features: Vec<u8>,
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// The short channel ID
	pub short_channel_id: u64,
	/// One of the two node_ids which are endpoints of this channel, ordered by compressed key
	pub node_id_1: NodeId,
	/// The other of the two node_ids which are endpoints of this channel
	pub node_id_2: NodeId,
	/// The funding key for the first node
	pub bitcoin_key_1: NodeId,
	/// The funding key for the second node
	pub bitcoin_key_2: NodeId,
}

/// A channel_announcement message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelAnnouncement {
	/// Authentication of the announcement by the first public node
	pub node_signature_1: Signature,
	/// Authentication of the announcement by the second public node
	pub node_signature_2: Signature,
	/// Proof of funding UTXO ownership by the first public node
	pub bitcoin_signature_1: Signature,
	/// Proof of funding UTXO ownership by the second public node
	pub bitcoin_signature_2: Signature,
	/// The actual announcement
	pub contents: UnsignedChannelAnnouncement,
}

impl std::hash::Hash for ChannelAnnouncement {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.node_signature_1.serialize_compact().hash(state);
		self.node_signature_2.serialize_compact().hash(state);
		self.bitcoin_signature_1.serialize_compact().hash(state);
		self.bitcoin_signature_2.serialize_compact().hash(state);
		self.contents.hash(state);
	}
}

impl Writeable for UnsignedChannelAnnouncement {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.features.write(writer)?;
		self.chain_hash.write(writer)?;
		self.short_channel_id.write(writer)?;
		self.node_id_1.write(writer)?;
		self.node_id_2.write(writer)?;
		self.bitcoin_key_1.write(writer)?;
		self.bitcoin_key_2.write(writer)
	}
}

impl Readable for UnsignedChannelAnnouncement {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(UnsignedChannelAnnouncement {
			features: Readable::read(reader)?,
			chain_hash: Readable::read(reader)?,
			short_channel_id: Readable::read(reader)?,
			node_id_1: Readable::read(reader)?,
			node_id_2: Readable::read(reader)?,
			bitcoin_key_1: Readable::read(reader)?,
			bitcoin_key_2: Readable::read(reader)?,
		})
	}
}

impl Writeable for ChannelAnnouncement {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.node_signature_1.write(writer)?;
		self.node_signature_2.write(writer)?;
		self.bitcoin_signature_1.write(writer)?;
		self.bitcoin_signature_2.write(writer)?;
		self.contents.write(writer)
	}
}

impl Readable for ChannelAnnouncement {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(ChannelAnnouncement {
			node_signature_1: Readable::read(reader)?,
			node_signature_2: Readable::read(reader)?,
			bitcoin_signature_1: Readable::read(reader)?,
			bitcoin_signature_2: Readable::read(reader)?,
			contents: Readable::read(reader)?,
		})
	}
}

/// The unsigned part of a channel_update
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnsignedChannelUpdate {
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// The short channel ID
	pub short_channel_id: u64,
	/// A strictly monotonic announcement counter, with gaps allowed, specific to this channel
	pub timestamp: u32,
	/// Flags pertaining to the message itself. The low bit indicates the presence of
	/// `htlc_maximum_msat`, which is forced on the wire to match the field.
	pub message_flags: u8,
	/// Flags pertaining to the channel. The low bit indicates the direction this update refers
	/// to (0 if it originates from the lexicographically lesser node), the next bit is set when
	/// the channel is temporarily disabled.
	pub channel_flags: u8,
	/// The number of blocks such that if:
	/// `incoming_htlc.cltv_expiry < outgoing_htlc.cltv_expiry + cltv_expiry_delta`
	/// then we need to fail the HTLC backwards.
	pub cltv_expiry_delta: u16,
	/// The minimum HTLC size incoming to the sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The base HTLC fee charged by the sender, in milli-satoshi
	pub fee_base_msat: u32,
	/// The amount to fee multiplier, in micro-satoshi
	pub fee_proportional_millionths: u32,
	/// The maximum HTLC value incoming to the sender, in milli-satoshi.
	pub htlc_maximum_msat: Option<u64>,
}

impl UnsignedChannelUpdate {
	/// Whether this update marks its direction of the channel as temporarily unusable
	pub fn is_disabled(&self) -> bool {
		self.channel_flags & (1 << 1) != 0
	}

	/// The direction bit: 0 when this update originates from the lexicographically lesser of the
	/// two channel endpoints, 1 otherwise
	pub fn direction(&self) -> u8 {
		self.channel_flags & 1
	}
}

/// A channel_update message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdate {
	/// A signature of the channel update
	pub signature: Signature,
	/// The actual channel update
	pub contents: UnsignedChannelUpdate,
}

impl std::hash::Hash for ChannelUpdate {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.signature.serialize_compact().hash(state);
		self.contents.hash(state);
	}
}

impl Writeable for UnsignedChannelUpdate {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(writer)?;
		self.short_channel_id.write(writer)?;
		self.timestamp.write(writer)?;
		let message_flags = if self.htlc_maximum_msat.is_some() {
			self.message_flags | 1
		} else {
			self.message_flags & !1
		};
		message_flags.write(writer)?;
		self.channel_flags.write(writer)?;
		self.cltv_expiry_delta.write(writer)?;
		self.htlc_minimum_msat.write(writer)?;
		self.fee_base_msat.write(writer)?;
		self.fee_proportional_millionths.write(writer)?;
		if let Some(htlc_maximum_msat) = self.htlc_maximum_msat {
			htlc_maximum_msat.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for UnsignedChannelUpdate {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let chain_hash: BlockHash = Readable::read(reader)?;
		let short_channel_id: u64 = Readable::read(reader)?;
		let timestamp: u32 = Readable::read(reader)?;
		let message_flags: u8 = Readable::read(reader)?;
		let channel_flags: u8 = Readable::read(reader)?;
		let cltv_expiry_delta: u16 = Readable::read(reader)?;
		let htlc_minimum_msat: u64 = Readable::read(reader)?;
		let fee_base_msat: u32 = Readable::read(reader)?;
		let fee_proportional_millionths: u32 = Readable::read(reader)?;
		let htlc_maximum_msat = if message_flags & 1 != 0 {
			Some(Readable::read(reader)?)
		} else {
			None
		};
		Ok(UnsignedChannelUpdate {
			chain_hash, short_channel_id, timestamp, message_flags, channel_flags,
			cltv_expiry_delta, htlc_minimum_msat, fee_base_msat, fee_proportional_millionths,
			htlc_maximum_msat,
		})
	}
}

impl Writeable for ChannelUpdate {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.signature.write(writer)?;
		self.contents.write(writer)
	}
}

impl Readable for ChannelUpdate {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(ChannelUpdate {
			signature: Readable::read(reader)?,
			contents: Readable::read(reader)?,
		})
	}
}

macro_rules! hash_to_message {
	($slice: expr) => {
		Message::from_slice($slice).unwrap()
	}
}

macro_rules! secp_verify_sig {
	( $secp_ctx: expr, $msg: expr, $sig: expr, $node_id: expr, $msg_type: expr ) => {
		match $node_id.as_pubkey() {
			Ok(pubkey) => match $secp_ctx.verify_ecdsa($msg, $sig, &pubkey) {
				Ok(_) => {},
				Err(_) => return Err(LightningError {
					err: format!("Invalid signature on {} message", $msg_type),
					action: ErrorAction::SendInvalidSignature,
				}),
			},
			Err(_) => return Err(LightningError {
				err: format!("Invalid public key on {} message", $msg_type),
				action: ErrorAction::SendInvalidSignature,
			}),
		}
	};
}

impl ChannelAnnouncement {
	/// Checks all four signatures against the announced keys. The announcement must not be
	/// admitted to the channel table when this fails.
	pub fn verify<C: secp256k1::Verification>(&self, secp_ctx: &Secp256k1<C>) -> Result<(), LightningError> {
		let msg_hash = hash_to_message!(&Sha256dHash::hash(&self.contents.encode()[..])[..]);
		secp_verify_sig!(secp_ctx, &msg_hash, &self.node_signature_1, &self.contents.node_id_1, "channel_announcement");
		secp_verify_sig!(secp_ctx, &msg_hash, &self.node_signature_2, &self.contents.node_id_2, "channel_announcement");
		secp_verify_sig!(secp_ctx, &msg_hash, &self.bitcoin_signature_1, &self.contents.bitcoin_key_1, "channel_announcement");
		secp_verify_sig!(secp_ctx, &msg_hash, &self.bitcoin_signature_2, &self.contents.bitcoin_key_2, "channel_announcement");
		Ok(())
	}
}

impl NodeAnnouncement {
	/// Checks the announcement signature against the announced node id.
	pub fn verify<C: secp256k1::Verification>(&self, secp_ctx: &Secp256k1<C>) -> Result<(), LightningError> {
		let msg_hash = hash_to_message!(&Sha256dHash::hash(&self.contents.encode()[..])[..]);
		secp_verify_sig!(secp_ctx, &msg_hash, &self.signature, &self.contents.node_id, "node_announcement");
		Ok(())
	}
}

impl ChannelUpdate {
	/// Checks the update signature against the node the update claims to originate from.
	pub fn verify<C: secp256k1::Verification>(&self, secp_ctx: &Secp256k1<C>, node_id: &NodeId) -> Result<(), LightningError> {
		let msg_hash = hash_to_message!(&Sha256dHash::hash(&self.contents.encode()[..])[..]);
		secp_verify_sig!(secp_ctx, &msg_hash, &self.signature, node_id, "channel_update");
		Ok(())
	}
}

fn write_short_channel_ids<W: Writer>(ids: &Vec<u64>, writer: &mut W) -> Result<(), io::Error> {
	((1 + ids.len() * 8) as u16).write(writer)?;
	// encoding byte: uncompressed
	0u8.write(writer)?;
	for id in ids.iter() {
		id.write(writer)?;
	}
	Ok(())
}

fn read_short_channel_ids<R: Read>(reader: &mut R) -> Result<Vec<u64>, DecodeError> {
	let len: u16 = Readable::read(reader)?;
	if len == 0 {
		return Ok(Vec::new());
	}
	let encoding: u8 = Readable::read(reader)?;
	match encoding {
		0 => {},
		1 => return Err(DecodeError::UnsupportedEncoding),
		_ => return Err(DecodeError::InvalidValue),
	}
	if (len - 1) % 8 != 0 {
		return Err(DecodeError::BadLengthDescriptor);
	}
	let count = ((len - 1) / 8) as usize;
	let mut ids = Vec::with_capacity(count);
	for _ in 0..count {
		ids.push(Readable::read(reader)?);
	}
	Ok(ids)
}

fn write_tlv_record<W: Writer>(typ: u64, value: &[u8], writer: &mut W) -> Result<(), io::Error> {
	BigSize(typ).write(writer)?;
	BigSize(value.len() as u64).write(writer)?;
	writer.write_all(value)
}

/// Walks the trailing extension records of a message, handing each record's value to the given
/// closure. The closure returns whether it knew the record's type; unknown odd types are
/// skipped, unknown even ones fail the read.
fn read_tlv_stream<R: Read, F: FnMut(u64, &[u8]) -> Result<bool, DecodeError>>(reader: &mut R, mut handle_record: F) -> Result<(), DecodeError> {
	loop {
		let mut first = [0u8; 1];
		match reader.read(&mut first) {
			Ok(0) => return Ok(()),
			Ok(_) => {},
			Err(e) => return Err(e.into()),
		}
		let mut typ_reader = (&first[..]).chain(&mut *reader);
		let typ: BigSize = Readable::read(&mut typ_reader)?;
		let len: BigSize = Readable::read(reader)?;
		if len.0 > 65535 {
			return Err(DecodeError::BadLengthDescriptor);
		}
		let mut value = vec![0u8; len.0 as usize];
		reader.read_exact(&mut value)?;
		if !handle_record(typ.0, &value)? {
			if typ.0 % 2 == 0 {
				return Err(DecodeError::UnknownRequiredFeature);
			}
		}
	}
}

/// A query_channel_range message: asks a peer for the short channel ids of all channels it knows
/// funded within a block window. `query_flags` carries the timestamp/checksum extension bits; when
/// absent the peer replies in the plain flavor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryChannelRange {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The height of the first block for the channel UTXOs being queried
	pub first_blocknum: u32,
	/// The number of blocks to include in the query results
	pub number_of_blocks: u32,
	/// Extension bits ([`QUERY_FLAG_TIMESTAMPS`], [`QUERY_FLAG_CHECKSUMS`]) selecting the reply
	/// flavor
	pub query_flags: Option<u8>,
}

impl QueryChannelRange {
	/// The first block after the query's window, saturating at the maximum encodable height.
	pub fn end_blocknum(&self) -> u32 {
		match self.first_blocknum.checked_add(self.number_of_blocks) {
			Some(block) => block,
			None => u32::max_value(),
		}
	}
}

impl Writeable for QueryChannelRange {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(writer)?;
		self.first_blocknum.write(writer)?;
		self.number_of_blocks.write(writer)?;
		if let Some(flags) = self.query_flags {
			write_tlv_record(1, &[flags], writer)?;
		}
		Ok(())
	}
}

impl Readable for QueryChannelRange {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let chain_hash: BlockHash = Readable::read(reader)?;
		let first_blocknum: u32 = Readable::read(reader)?;
		let number_of_blocks: u32 = Readable::read(reader)?;
		let mut query_flags = None;
		read_tlv_stream(reader, |typ, value| {
			match typ {
				1 => {
					if value.len() != 1 {
						return Err(DecodeError::BadLengthDescriptor);
					}
					query_flags = Some(value[0]);
					Ok(true)
				},
				_ => Ok(false),
			}
		})?;
		Ok(QueryChannelRange { chain_hash, first_blocknum, number_of_blocks, query_flags })
	}
}

/// Update timestamps for one short channel id in a reply_channel_range, one per direction. Zero
/// means the peer has no update for that direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateTimestamps {
	/// Timestamp of the update originating from the lexicographically lesser node
	pub timestamp_1: u32,
	/// Timestamp of the update originating from the lexicographically greater node
	pub timestamp_2: u32,
}

/// Update checksums for one short channel id in a reply_channel_range, one per direction. Zero
/// means the peer has no update for that direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateChecksums {
	/// Checksum of the update originating from the lexicographically lesser node
	pub checksum_1: u32,
	/// Checksum of the update originating from the lexicographically greater node
	pub checksum_2: u32,
}

/// A reply_channel_range message: the peer's short channel ids within the queried window,
/// optionally annotated with per-id update timestamps and checksums. Multiple replies may answer
/// one query, the last one carrying `sync_complete`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyChannelRange {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The height of the first block in the range of the reply
	pub first_blocknum: u32,
	/// The number of blocks included in the range of the reply
	pub number_of_blocks: u32,
	/// True when this is the final reply for a query
	pub sync_complete: bool,
	/// The short_channel_ids in the channel range
	pub short_channel_ids: Vec<u64>,
	/// Per-id update timestamps, aligned with `short_channel_ids`
	pub timestamps: Option<Vec<UpdateTimestamps>>,
	/// Per-id update checksums, aligned with `short_channel_ids`
	pub checksums: Option<Vec<UpdateChecksums>>,
}

impl ReplyChannelRange {
	/// The first block after the reply's declared window, saturating at the maximum encodable
	/// height.
	pub fn end_blocknum(&self) -> u32 {
		match self.first_blocknum.checked_add(self.number_of_blocks) {
			Some(block) => block,
			None => u32::max_value(),
		}
	}
}

impl Writeable for ReplyChannelRange {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(writer)?;
		self.first_blocknum.write(writer)?;
		self.number_of_blocks.write(writer)?;
		self.sync_complete.write(writer)?;
		write_short_channel_ids(&self.short_channel_ids, writer)?;
		if let Some(ref timestamps) = self.timestamps {
			let mut value = VecWriter(Vec::new());
			// encoding byte: uncompressed
			0u8.write(&mut value)?;
			for ts in timestamps.iter() {
				ts.timestamp_1.write(&mut value)?;
				ts.timestamp_2.write(&mut value)?;
			}
			write_tlv_record(1, &value.0, writer)?;
		}
		if let Some(ref checksums) = self.checksums {
			let mut value = VecWriter(Vec::new());
			for cs in checksums.iter() {
				cs.checksum_1.write(&mut value)?;
				cs.checksum_2.write(&mut value)?;
			}
			write_tlv_record(3, &value.0, writer)?;
		}
		Ok(())
	}
}

impl Readable for ReplyChannelRange {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let chain_hash: BlockHash = Readable::read(reader)?;
		let first_blocknum: u32 = Readable::read(reader)?;
		let number_of_blocks: u32 = Readable::read(reader)?;
		let sync_complete: bool = Readable::read(reader)?;
		let short_channel_ids = read_short_channel_ids(reader)?;
		let mut timestamps = None;
		let mut checksums = None;
		read_tlv_stream(reader, |typ, value| {
			match typ {
				1 => {
					if value.is_empty() || (value.len() - 1) % 8 != 0 {
						return Err(DecodeError::BadLengthDescriptor);
					}
					match value[0] {
						0 => {},
						1 => return Err(DecodeError::UnsupportedEncoding),
						_ => return Err(DecodeError::InvalidValue),
					}
					let mut entries = Vec::with_capacity((value.len() - 1) / 8);
					let mut value_reader = &value[1..];
					while !value_reader.is_empty() {
						entries.push(UpdateTimestamps {
							timestamp_1: Readable::read(&mut value_reader)?,
							timestamp_2: Readable::read(&mut value_reader)?,
						});
					}
					timestamps = Some(entries);
					Ok(true)
				},
				3 => {
					if value.len() % 8 != 0 {
						return Err(DecodeError::BadLengthDescriptor);
					}
					let mut entries = Vec::with_capacity(value.len() / 8);
					let mut value_reader = &value[..];
					while !value_reader.is_empty() {
						entries.push(UpdateChecksums {
							checksum_1: Readable::read(&mut value_reader)?,
							checksum_2: Readable::read(&mut value_reader)?,
						});
					}
					checksums = Some(entries);
					Ok(true)
				},
				_ => Ok(false),
			}
		})?;
		Ok(ReplyChannelRange {
			chain_hash, first_blocknum, number_of_blocks, sync_complete, short_channel_ids,
			timestamps, checksums,
		})
	}
}

/// A query_short_channel_ids message, used to ask a peer for routing gossip messages for a set of
/// channels. The optional per-id `query_flags` narrow the request to specific messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryShortChannelIds {
	/// The genesis hash of the blockchain being queried
	pub chain_hash: BlockHash,
	/// The short_channel_ids that are being queried
	pub short_channel_ids: Vec<u64>,
	/// Per-id [`SCID_QUERY_FLAG_ANNOUNCEMENT`]-style bits, aligned with `short_channel_ids`
	pub query_flags: Option<Vec<u8>>,
}

impl Writeable for QueryShortChannelIds {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(writer)?;
		write_short_channel_ids(&self.short_channel_ids, writer)?;
		if let Some(ref flags) = self.query_flags {
			let mut value = VecWriter(Vec::new());
			// encoding byte: uncompressed
			0u8.write(&mut value)?;
			value.write_all(&flags)?;
			write_tlv_record(1, &value.0, writer)?;
		}
		Ok(())
	}
}

impl Readable for QueryShortChannelIds {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let chain_hash: BlockHash = Readable::read(reader)?;
		let short_channel_ids = read_short_channel_ids(reader)?;
		let mut query_flags = None;
		read_tlv_stream(reader, |typ, value| {
			match typ {
				1 => {
					if value.is_empty() {
						return Err(DecodeError::BadLengthDescriptor);
					}
					match value[0] {
						0 => {},
						1 => return Err(DecodeError::UnsupportedEncoding),
						_ => return Err(DecodeError::InvalidValue),
					}
					query_flags = Some(value[1..].to_vec());
					Ok(true)
				},
				_ => Ok(false),
			}
		})?;
		Ok(QueryShortChannelIds { chain_hash, short_channel_ids, query_flags })
	}
}

/// A reply_short_channel_ids_end message, sent by a peer when it is done responding to a
/// query_short_channel_ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyShortChannelIdsEnd {
	/// The genesis hash of the blockchain that was queried
	pub chain_hash: BlockHash,
	/// Indicates if the query recipient maintains up-to-date channel information for the
	/// chain_hash
	pub full_information: bool,
}

impl Writeable for ReplyShortChannelIdsEnd {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(writer)?;
		self.full_information.write(writer)
	}
}

impl Readable for ReplyShortChannelIdsEnd {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let chain_hash: BlockHash = Readable::read(reader)?;
		let full_information: bool = Readable::read(reader)?;
		// No known extension records, but trailing ones still follow the odd/even rule.
		read_tlv_stream(reader, |_, _| Ok(false))?;
		Ok(ReplyShortChannelIdsEnd { chain_hash, full_information })
	}
}

/// A gossip_timestamp_filter message: tells the peer which gossip, by update timestamp, we care
/// to receive from it going forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipTimestampFilter {
	/// The genesis hash of the blockchain for channel and node information
	pub chain_hash: BlockHash,
	/// The starting unix timestamp
	pub first_timestamp: u32,
	/// The range of information in seconds
	pub timestamp_range: u32,
}

impl Writeable for GossipTimestampFilter {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(writer)?;
		self.first_timestamp.write(writer)?;
		self.timestamp_range.write(writer)
	}
}

impl Readable for GossipTimestampFilter {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let chain_hash: BlockHash = Readable::read(reader)?;
		let first_timestamp: u32 = Readable::read(reader)?;
		let timestamp_range: u32 = Readable::read(reader)?;
		read_tlv_stream(reader, |_, _| Ok(false))?;
		Ok(GossipTimestampFilter { chain_hash, first_timestamp, timestamp_range })
	}
}

impl GossipTimestampFilter {
	/// Whether the given timestamp falls within this filter's window.
	pub fn includes(&self, timestamp: u32) -> bool {
		timestamp >= self.first_timestamp
			&& (timestamp as u64) < self.first_timestamp as u64 + self.timestamp_range as u64
	}
}

/// The routing messages a peer can hand the router, as one closed enum so dispatch stays
/// exhaustive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingMessage {
	/// A channel_announcement
	ChannelAnnouncement(ChannelAnnouncement),
	/// A channel_update
	ChannelUpdate(ChannelUpdate),
	/// A node_announcement
	NodeAnnouncement(NodeAnnouncement),
	/// A query_channel_range
	QueryChannelRange(QueryChannelRange),
	/// A reply_channel_range
	ReplyChannelRange(ReplyChannelRange),
	/// A query_short_channel_ids
	QueryShortChannelIds(QueryShortChannelIds),
	/// A reply_short_channel_ids_end
	ReplyShortChannelIdsEnd(ReplyShortChannelIdsEnd),
	/// A gossip_timestamp_filter
	GossipTimestampFilter(GossipTimestampFilter),
}

impl RoutingMessage {
	/// The chain this message pertains to, if it names one (node announcements don't).
	pub fn chain_hash(&self) -> Option<&BlockHash> {
		match self {
			RoutingMessage::ChannelAnnouncement(ref msg) => Some(&msg.contents.chain_hash),
			RoutingMessage::ChannelUpdate(ref msg) => Some(&msg.contents.chain_hash),
			RoutingMessage::NodeAnnouncement(_) => None,
			RoutingMessage::QueryChannelRange(ref msg) => Some(&msg.chain_hash),
			RoutingMessage::ReplyChannelRange(ref msg) => Some(&msg.chain_hash),
			RoutingMessage::QueryShortChannelIds(ref msg) => Some(&msg.chain_hash),
			RoutingMessage::ReplyShortChannelIdsEnd(ref msg) => Some(&msg.chain_hash),
			RoutingMessage::GossipTimestampFilter(ref msg) => Some(&msg.chain_hash),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{get_signed_channel_announcement, get_signed_channel_update, get_signed_node_announcement};

	use bitcoin::blockdata::constants::genesis_block;
	use bitcoin::network::constants::Network;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	fn chain_hash() -> BlockHash {
		genesis_block(Network::Testnet).header.block_hash()
	}

	#[test]
	fn node_id_formats_as_hex() {
		let secp_ctx = Secp256k1::new();
		let node_key = SecretKey::from_slice(&hex::decode("0202020202020202020202020202020202020202020202020202020202020202").unwrap()[..]).unwrap();
		let node_id = NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx, &node_key));
		assert_eq!(node_id.to_string(), hex::encode(node_id.as_slice()));
		assert_eq!(format!("{:?}", node_id), format!("NodeId({})", hex::encode(node_id.as_slice())));
		assert_eq!(NodeId::from_slice(node_id.as_slice()).unwrap(), node_id);
	}

	#[test]
	fn channel_update_round_trip() {
		let secp_ctx = Secp256k1::new();
		let node_key = SecretKey::from_slice(&[42; 32]).unwrap();
		let update = get_signed_channel_update(|_| {}, &node_key, &secp_ctx);
		let encoded = update.encode();
		let decoded: ChannelUpdate = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(update, decoded);

		let no_max = get_signed_channel_update(|unsigned| {
			unsigned.htlc_maximum_msat = None;
		}, &node_key, &secp_ctx);
		let encoded = no_max.encode();
		let decoded: ChannelUpdate = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(decoded.contents.htlc_maximum_msat, None);
		assert_eq!(decoded.contents.message_flags & 1, 0);
	}

	#[test]
	fn channel_announcement_round_trip_and_verify() {
		let secp_ctx = Secp256k1::new();
		let node_1_key = SecretKey::from_slice(&[42; 32]).unwrap();
		let node_2_key = SecretKey::from_slice(&[41; 32]).unwrap();
		let announcement = get_signed_channel_announcement(|_| {}, &node_1_key, &node_2_key, &secp_ctx);
		let encoded = announcement.encode();
		let decoded: ChannelAnnouncement = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(announcement, decoded);
		decoded.verify(&secp_ctx).unwrap();

		// Flipping any content byte must invalidate the signatures
		let mut tampered = announcement.clone();
		tampered.contents.short_channel_id += 1;
		match tampered.verify(&secp_ctx) {
			Err(LightningError { action: ErrorAction::SendInvalidSignature, .. }) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn node_announcement_round_trip_and_verify() {
		let secp_ctx = Secp256k1::new();
		let node_key = SecretKey::from_slice(&[42; 32]).unwrap();
		let announcement = get_signed_node_announcement(|unsigned| {
			unsigned.addresses = vec![
				NetAddress::IPv4 { addr: [127, 0, 0, 1], port: 9735 },
				NetAddress::IPv6 { addr: [0; 16], port: 9735 },
				NetAddress::OnionV3 { ed25519_pubkey: [7; 32], checksum: 32, version: 3, port: 9735 },
			];
		}, &node_key, &secp_ctx);
		let encoded = announcement.encode();
		let decoded: NodeAnnouncement = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(announcement, decoded);
		decoded.verify(&secp_ctx).unwrap();

		let mut tampered = announcement.clone();
		tampered.contents.timestamp += 1;
		assert!(tampered.verify(&secp_ctx).is_err());
	}

	#[test]
	fn query_channel_range_flavors() {
		for query_flags in [None, Some(QUERY_FLAG_TIMESTAMPS), Some(QUERY_FLAG_TIMESTAMPS | QUERY_FLAG_CHECKSUMS)] {
			let query = QueryChannelRange {
				chain_hash: chain_hash(),
				first_blocknum: 0,
				number_of_blocks: u32::max_value(),
				query_flags,
			};
			let encoded = query.encode();
			let decoded: QueryChannelRange = Readable::read(&mut &encoded[..]).unwrap();
			assert_eq!(query, decoded);
		}
		let query = QueryChannelRange {
			chain_hash: chain_hash(),
			first_blocknum: 0xffff_0000,
			number_of_blocks: 0x0002_0000,
			query_flags: None,
		};
		assert_eq!(query.end_blocknum(), u32::max_value());
	}

	#[test]
	fn reply_channel_range_round_trip() {
		let reply = ReplyChannelRange {
			chain_hash: chain_hash(),
			first_blocknum: 100,
			number_of_blocks: 500,
			sync_complete: true,
			short_channel_ids: vec![0x000001_000001_0000, 0x000002_000001_0001],
			timestamps: Some(vec![
				UpdateTimestamps { timestamp_1: 1, timestamp_2: 2 },
				UpdateTimestamps { timestamp_1: 0, timestamp_2: 3 },
			]),
			checksums: Some(vec![
				UpdateChecksums { checksum_1: 0xdead, checksum_2: 0xbeef },
				UpdateChecksums { checksum_1: 0, checksum_2: 1 },
			]),
		};
		let encoded = reply.encode();
		let decoded: ReplyChannelRange = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(reply, decoded);

		let plain = ReplyChannelRange { timestamps: None, checksums: None, ..reply };
		let encoded = plain.encode();
		let decoded: ReplyChannelRange = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(plain, decoded);
	}

	#[test]
	fn query_short_channel_ids_round_trip() {
		let query = QueryShortChannelIds {
			chain_hash: chain_hash(),
			short_channel_ids: vec![1, 2, 3],
			query_flags: Some(vec![
				SCID_QUERY_FLAG_ANNOUNCEMENT,
				SCID_QUERY_FLAG_UPDATE_1,
				SCID_QUERY_FLAG_ANNOUNCEMENT | SCID_QUERY_FLAG_UPDATE_1 | SCID_QUERY_FLAG_UPDATE_2,
			]),
		};
		let encoded = query.encode();
		let decoded: QueryShortChannelIds = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(query, decoded);
	}

	#[test]
	fn rejects_compressed_id_encoding() {
		let query = QueryShortChannelIds {
			chain_hash: chain_hash(),
			short_channel_ids: vec![42],
			query_flags: None,
		};
		let mut encoded = query.encode();
		// poke the encoding byte (right after the 32-byte chain hash and 2-byte length)
		encoded[34] = 1;
		match <QueryShortChannelIds as Readable>::read(&mut &encoded[..]) {
			Err(DecodeError::UnsupportedEncoding) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn skips_unknown_odd_records() {
		let end = ReplyShortChannelIdsEnd { chain_hash: chain_hash(), full_information: true };
		let mut encoded = end.encode();
		// append an odd-typed record (type 9) followed by an even one (type 8)
		encoded.extend_from_slice(&[9, 2, 0xab, 0xcd]);
		let decoded: ReplyShortChannelIdsEnd = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(end, decoded);

		let mut encoded = end.encode();
		encoded.extend_from_slice(&[8, 1, 0x00]);
		match <ReplyShortChannelIdsEnd as Readable>::read(&mut &encoded[..]) {
			Err(DecodeError::UnknownRequiredFeature) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn gossip_timestamp_filter_window() {
		let filter = GossipTimestampFilter {
			chain_hash: chain_hash(),
			first_timestamp: 100,
			timestamp_range: 50,
		};
		assert!(!filter.includes(99));
		assert!(filter.includes(100));
		assert!(filter.includes(149));
		assert!(!filter.includes(150));

		let pass_all = GossipTimestampFilter {
			chain_hash: chain_hash(),
			first_timestamp: 0,
			timestamp_range: u32::max_value(),
		};
		assert!(pass_all.includes(0));
		assert!(pass_all.includes(u32::max_value() - 1));
	}
}
