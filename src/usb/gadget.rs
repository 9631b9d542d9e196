//! Runs a [`MassStorageFunction`] against asynchronous endpoints.
//!
//! The endpoints are bounded tokio channels standing in for the control pipe and
//! the two bulk pipes of a USB device controller. [`endpoints`] creates both ends;
//! [`serve`] drives the function with one end while a [`HostPort`] (see
//! [`super::host`]) plays the host on the other.

use color_eyre::eyre::{bail, ensure, eyre};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::ProtocolError;
use super::control::{ClassRequest, SetupPacket};
use super::function::{MassStorageFunction, Reply};

pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;
pub const DEFAULT_IN_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_OUT_TRANSFERS_IN_FLIGHT: usize = 2;
pub const DEFAULT_OUT_PACKETS_PER_TRANSFER: usize = 10;

/// Control transfers are answered one at a time.
const CONTROL_QUEUE_DEPTH: usize = 1;

/// Transport tunables. None of these change what the function answers, only how
/// the answer is cut into transfers and how much may be queued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionConfig {
    /// `wMaxPacketSize` of the bulk endpoints (512 at high speed).
    pub max_packet_size: usize,
    /// How many bulk-IN transfers may be queued before the function waits for the host.
    pub in_queue_depth: usize,
    /// How many bulk-OUT transfers may be in flight towards the function.
    pub out_transfers_in_flight: usize,
    /// Packets per bulk transfer.
    pub out_packets_per_transfer: usize,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            in_queue_depth: DEFAULT_IN_QUEUE_DEPTH,
            out_transfers_in_flight: DEFAULT_OUT_TRANSFERS_IN_FLIGHT,
            out_packets_per_transfer: DEFAULT_OUT_PACKETS_PER_TRANSFER,
        }
    }
}

impl FunctionConfig {
    /// Largest number of bytes moved by one bulk transfer.
    pub fn transfer_size(&self) -> usize {
        self.max_packet_size * self.out_packets_per_transfer
    }

    pub fn validate(&self) -> color_eyre::Result<()> {
        ensure!(self.max_packet_size > 0, "max packet size must not be zero");
        ensure!(self.in_queue_depth > 0, "in queue depth must not be zero");
        ensure!(
            self.out_transfers_in_flight > 0,
            "at least one out transfer must be allowed in flight"
        );
        ensure!(
            self.out_packets_per_transfer > 0,
            "a transfer needs at least one packet"
        );
        self.max_packet_size
            .checked_mul(self.out_packets_per_transfer)
            .ok_or_else(|| eyre!("transfer size overflows"))?;
        Ok(())
    }
}

/// One completion on the bulk-IN endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BulkIn {
    Transfer(Vec<u8>),
    /// The endpoint is halted until the host resets the function.
    Stall,
}

/// A setup packet and the slot for its answer. An error stalls endpoint 0.
pub struct ControlRequest {
    pub setup: SetupPacket,
    pub reply: oneshot::Sender<Result<Vec<u8>, ProtocolError>>,
}

/// The device end of the endpoints, consumed by [`serve`].
pub struct FunctionEndpoints {
    control: mpsc::Receiver<ControlRequest>,
    bulk_out: mpsc::Receiver<Vec<u8>>,
    bulk_in: mpsc::Sender<BulkIn>,
    transfer_size: usize,
}

/// The host end of the endpoints.
pub struct HostPort {
    control: mpsc::Sender<ControlRequest>,
    bulk_out: mpsc::Sender<Vec<u8>>,
    bulk_in: mpsc::Receiver<BulkIn>,
    transfer_size: usize,
}

/// Creates a connected pair of endpoint ends.
pub fn endpoints(config: &FunctionConfig) -> color_eyre::Result<(HostPort, FunctionEndpoints)> {
    config.validate()?;
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(config.out_transfers_in_flight);
    let (in_tx, in_rx) = mpsc::channel(config.in_queue_depth);
    let transfer_size = config.transfer_size();
    Ok((
        HostPort {
            control: control_tx,
            bulk_out: out_tx,
            bulk_in: in_rx,
            transfer_size,
        },
        FunctionEndpoints {
            control: control_rx,
            bulk_out: out_rx,
            bulk_in: in_tx,
            transfer_size,
        },
    ))
}

/// Serves `function` until the host end is dropped, then hands the function back.
#[tracing::instrument(skip_all, fields(max_lun = function.max_lun()))]
pub async fn serve(
    mut function: MassStorageFunction,
    mut endpoints: FunctionEndpoints,
) -> color_eyre::Result<MassStorageFunction> {
    info!("function online");
    loop {
        tokio::select! {
            // a reset must never wait behind bulk traffic
            biased;
            request = endpoints.control.recv() => {
                let Some(request) = request else { break };
                answer_control(&mut endpoints.bulk_out, &mut function, request);
            }
            data = endpoints.bulk_out.recv() => {
                let Some(data) = data else { break };
                match function.on_bulk_out(&data) {
                    Ok(None) => {}
                    Ok(Some(reply)) => endpoints.send_reply(&mut function, reply).await?,
                    Err(ProtocolError::Stalled) => {
                        trace!(len = data.len(), "dropping bulk-out while halted");
                    }
                    Err(_) => {
                        if endpoints.bulk_in.send(BulkIn::Stall).await.is_err() {
                            bail!("bulk-in endpoint closed while halting it");
                        }
                    }
                }
            }
        }
    }
    info!("host disconnected");
    Ok(function)
}

/// Answers a control request. Returns whether it reset the function.
///
/// Takes only the bulk-OUT receiver so it can run while a bulk-IN send is pending.
fn answer_control(
    bulk_out: &mut mpsc::Receiver<Vec<u8>>,
    function: &mut MassStorageFunction,
    request: ControlRequest,
) -> bool {
    let ControlRequest { setup, reply } = request;
    let outcome = function.handle_setup(&setup);
    let reset = outcome.is_ok() && setup.class_request() == Some(ClassRequest::BulkOnlyReset);
    if reset {
        // anything queued before the reset belongs to the aborted command
        let mut dropped = 0;
        while bulk_out.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded bulk-out transfers");
        }
    }
    if let Err(err) = &outcome {
        warn!(%err, "stalling control endpoint");
    }
    if reply.send(outcome).is_err() {
        debug!("host abandoned the control request");
    }
    reset
}

impl FunctionEndpoints {
    /// Sends the Data-In payload and the CSW of `reply`, unless a reset comes first.
    async fn send_reply(
        &mut self,
        function: &mut MassStorageFunction,
        reply: Reply,
    ) -> color_eyre::Result<()> {
        let Self {
            control,
            bulk_out,
            bulk_in,
            transfer_size,
        } = self;
        let tag = reply.csw.tag;
        let mut transfers: Vec<Vec<u8>> = reply
            .data
            .chunks(*transfer_size)
            .map(<[u8]>::to_vec)
            .collect();
        // a short data phase must end with a short packet
        if reply.short && reply.data.len() % *transfer_size == 0 {
            transfers.push(Vec::new());
        }
        transfers.push(reply.csw_bytes().to_vec());

        for transfer in transfers {
            loop {
                tokio::select! {
                    biased;
                    request = control.recv() => {
                        let Some(request) = request else {
                            bail!("control endpoint closed with tag {tag} in flight");
                        };
                        if answer_control(bulk_out, function, request) {
                            debug!(tag, "reset aborted the reply");
                            return Ok(());
                        }
                    }
                    permit = bulk_in.reserve() => {
                        let permit = permit.map_err(|_| {
                            eyre!("bulk-in endpoint closed with tag {tag} in flight")
                        })?;
                        trace!(tag, len = transfer.len(), "bulk-in transfer");
                        permit.send(BulkIn::Transfer(transfer));
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl HostPort {
    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    /// Performs a control transfer and returns its data stage.
    pub async fn control(&self, setup: SetupPacket) -> color_eyre::Result<Vec<u8>> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlRequest { setup, reply })
            .await
            .map_err(|_| eyre!("function is not running"))?;
        Ok(response.await??)
    }

    /// Writes `data` to the bulk-OUT endpoint, one transfer at a time.
    pub async fn write(&self, data: &[u8]) -> color_eyre::Result<()> {
        for chunk in data.chunks(self.transfer_size) {
            self.bulk_out
                .send(chunk.to_vec())
                .await
                .map_err(|_| eyre!("function is not running"))?;
        }
        Ok(())
    }

    /// Reads one transfer from the bulk-IN endpoint.
    ///
    /// A halted endpoint is reported as [`ProtocolError::Stalled`].
    pub async fn read(&mut self) -> color_eyre::Result<Vec<u8>> {
        match self.bulk_in.recv().await {
            Some(BulkIn::Transfer(data)) => Ok(data),
            Some(BulkIn::Stall) => Err(ProtocolError::Stalled.into()),
            None => bail!("function is not running"),
        }
    }

    /// Throws away everything already queued on the bulk-IN endpoint.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.bulk_in.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
