//! The host end of the Bulk-Only transport.
//!
//! [`UsbDrive`] drives a function through a [`HostPort`] the way an operating
//! system's storage driver would. The simulator binary and the end-to-end tests
//! use it; the device side never depends on it.

use color_eyre::Result;
use color_eyre::eyre::{bail, ensure};
use tracing::{debug, info, warn};

use super::cbw::{
    CBWDirection, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator,
};
use super::control::SetupPacket;
use super::gadget::HostPort;
use crate::scsi::ByteStruct;
use crate::scsi::command::{self, CommandBlock};
use crate::scsi::response::{InquiryResponse, ReadCapacity10Response, RequestSenseResponse};

/// The only interface a Bulk-Only function exposes.
const INTERFACE: u16 = 0;

/// TEST UNIT READY attempts before a logical unit is given up on.
const READY_ATTEMPTS: usize = 5;

/// What initialization learned about one logical unit.
#[derive(Copy, Clone, Debug)]
pub struct LunInfo {
    pub inquiry: InquiryResponse,
    pub capacity: ReadCapacity10Response,
}

impl LunInfo {
    pub fn block_size(&self) -> u32 {
        self.capacity.block_length()
    }

    pub fn block_count(&self) -> u64 {
        u64::from(self.capacity.last_lba()) + 1
    }
}

/// An abstraction over a USB mass storage function, seen from the host.
///
/// Commands are built with [`crate::scsi::command`] and issued with
/// [`UsbDrive::submit`], or through the typed helpers.
pub struct UsbDrive {
    port: HostPort,
    tags: TagGenerator,
    luns: Vec<LunInfo>,
}

impl UsbDrive {
    /// Performs initialization on the function and returns a new [`UsbDrive`].
    ///
    /// This initialization sequence follows the order
    /// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>,
    ///
    /// where the author obtained it with a USB hardware signal analyzer and reverse engineering
    /// the implementations on macos, windows, and linux
    #[tracing::instrument(skip_all)]
    pub async fn open(port: HostPort) -> Result<Self> {
        let mut drive = Self {
            port,
            tags: TagGenerator::new(),
            luns: Vec::new(),
        };
        info!("starting device configuration");
        // 1. Request the maximum LUN
        let max_lun = drive.get_max_lun().await?;
        for lun in 0..=max_lun {
            // 2. Keep trying TEST UNIT READY until it succeeds
            drive.wait_until_ready(lun).await?;
            // 3. INQUIRY
            let inquiry = drive.inquiry(lun).await?;
            // 4. PREVENT ALLOW MEDIUM REMOVAL. According to the reference blog post, the
            // result can be ignored, and many drives do not support this command, but it's
            // submitted anyway to mimic other operating systems.
            let prevent = command::prevent_allow_medium_removal(false);
            if let Err(err) = drive.command(lun, &prevent, None).await {
                debug!(lun, %err, "prevent allow medium removal refused");
            }
            // 5. READ CAPACITY
            let capacity = drive.read_capacity(lun).await?;
            let (vendor, product) = (inquiry.features.vendor_id, inquiry.features.product_id);
            let vendor = String::from_utf8_lossy(&vendor);
            let product = String::from_utf8_lossy(&product);
            info!(
                lun,
                vendor = vendor.trim_end(),
                product = product.trim_end(),
                blocks = u64::from(capacity.last_lba()) + 1,
                block_size = capacity.block_length(),
                "logical unit configured"
            );
            drive.luns.push(LunInfo { inquiry, capacity });
        }
        Ok(drive)
    }

    pub fn luns(&self) -> &[LunInfo] {
        &self.luns
    }

    pub async fn get_max_lun(&self) -> Result<u8> {
        let response = self.port.control(SetupPacket::get_max_lun(INTERFACE)).await?;
        ensure!(
            response.len() == 1,
            "get max lun answered {} bytes instead of 1",
            response.len()
        );
        Ok(response[0])
    }

    /// Bulk-Only Mass Storage Reset, discarding whatever the function had queued.
    pub async fn reset(&mut self) -> Result<()> {
        self.port.control(SetupPacket::bulk_only_reset(INTERFACE)).await?;
        let discarded = self.port.discard_pending();
        if discarded > 0 {
            debug!(discarded, "discarded stale bulk-in transfers");
        }
        Ok(())
    }

    /// Issues a command and returns its Data-In payload together with the CSW.
    ///
    /// `data_out` must hold exactly the declared transfer length for Data-Out commands.
    pub async fn submit(
        &mut self,
        lun: u8,
        command: &CommandBlock,
        data_out: Option<&[u8]>,
    ) -> Result<(Vec<u8>, CommandStatusWrapper)> {
        let tag = self.tags.tag();
        let cbw = CommandBlockWrapper::new(command, lun, tag);
        debug!(
            tag,
            lun,
            opcode = command.command.opcode(),
            length = command.data_transfer_len,
            "submitting command"
        );
        self.port.write(&cbw.to_bytes()).await?;

        let expected = command.data_transfer_len as usize;
        let mut data = Vec::new();
        match cbw.direction() {
            CBWDirection::DataOut => {
                let payload = data_out.unwrap_or_default();
                ensure!(
                    payload.len() == expected,
                    "command declares {expected} bytes of data-out, {} given",
                    payload.len()
                );
                self.port.write(payload).await?;
            }
            CBWDirection::DataIn => {
                // a short transfer ends the data phase early
                while data.len() < expected {
                    let transfer = self.port.read().await?;
                    let short = transfer.len() < self.port.transfer_size();
                    data.extend_from_slice(&transfer);
                    if short {
                        break;
                    }
                }
            }
            CBWDirection::NonDirectional => {}
        }

        let csw = CommandStatusWrapper::from_slice(&self.port.read().await?)?;
        ensure!(
            csw.tag == tag,
            "command status wrapper tag {} does not match command tag {tag}",
            csw.tag
        );
        Ok((data, csw))
    }

    /// Issues a command and turns anything but a passed CSW into an error.
    ///
    /// A failed command is followed by REQUEST SENSE; a phase error by a reset.
    pub async fn command(
        &mut self,
        lun: u8,
        command: &CommandBlock,
        data_out: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let (data, csw) = self.submit(lun, command, data_out).await?;
        match csw.status {
            CommandStatus::Passed => Ok(data),
            CommandStatus::Failed => {
                let sense = self.request_sense(lun).await?;
                bail!(
                    "command {:#04x} failed with sense key {:#x}, asc/ascq {}",
                    command.command.opcode(),
                    sense.sense_key(),
                    sense.asc_ascq()
                )
            }
            CommandStatus::PhaseError => {
                warn!(tag = csw.tag, "phase error, resetting");
                self.reset().await?;
                bail!(
                    "command {:#04x} ended in a phase error, residue {}",
                    command.command.opcode(),
                    csw.data_residue
                )
            }
        }
    }

    async fn wait_until_ready(&mut self, lun: u8) -> Result<()> {
        for attempt in 1..=READY_ATTEMPTS {
            let (_, csw) = self.submit(lun, &command::test_unit_ready(), None).await?;
            if csw.status == CommandStatus::Passed {
                return Ok(());
            }
            let sense = self.request_sense(lun).await?;
            debug!(
                lun,
                attempt,
                sense_key = sense.sense_key(),
                asc_ascq = %sense.asc_ascq(),
                "logical unit not ready"
            );
        }
        bail!("logical unit {lun} did not become ready")
    }

    pub async fn request_sense(&mut self, lun: u8) -> Result<RequestSenseResponse> {
        let length = std::mem::size_of::<RequestSenseResponse>();
        let (data, csw) = self
            .submit(lun, &command::request_sense(length as u8), None)
            .await?;
        ensure!(
            csw.status == CommandStatus::Passed,
            "request sense failed with {:?}",
            csw.status
        );
        Ok(*RequestSenseResponse::from_slice(&data)?)
    }

    pub async fn inquiry(&mut self, lun: u8) -> Result<InquiryResponse> {
        let data = self.command(lun, &command::inquiry(), None).await?;
        Ok(*InquiryResponse::from_slice(&data)?)
    }

    pub async fn read_capacity(&mut self, lun: u8) -> Result<ReadCapacity10Response> {
        let data = self.command(lun, &command::read_capacity(), None).await?;
        Ok(*ReadCapacity10Response::from_slice(&data)?)
    }

    /// Reads `blocks` blocks starting at `lba`.
    pub async fn read(&mut self, lun: u8, lba: u32, blocks: u16) -> Result<Vec<u8>> {
        let block_size = self.lun_info(lun)?.block_size();
        self.command(lun, &command::read10(lba, blocks, block_size), None)
            .await
    }

    /// Writes `data`, a whole number of blocks, starting at `lba`.
    pub async fn write(&mut self, lun: u8, lba: u32, data: &[u8]) -> Result<()> {
        let blocks = self.blocks_in(lun, data)?;
        let block_size = self.lun_info(lun)?.block_size();
        self.command(lun, &command::write10(lba, blocks, block_size), Some(data))
            .await?;
        Ok(())
    }

    /// Compares `data` against the medium starting at `lba`.
    pub async fn verify(&mut self, lun: u8, lba: u32, data: &[u8]) -> Result<()> {
        let blocks = self.blocks_in(lun, data)?;
        let block_size = self.lun_info(lun)?.block_size();
        self.command(
            lun,
            &command::verify10(lba, blocks, block_size, true),
            Some(data),
        )
        .await?;
        Ok(())
    }

    fn lun_info(&self, lun: u8) -> Result<&LunInfo> {
        match self.luns.get(usize::from(lun)) {
            Some(info) => Ok(info),
            None => bail!("logical unit {lun} is not configured"),
        }
    }

    fn blocks_in(&self, lun: u8, data: &[u8]) -> Result<u16> {
        let block_size = self.lun_info(lun)?.block_size() as usize;
        ensure!(
            data.len() % block_size == 0,
            "{} bytes is not a whole number of {block_size} byte blocks",
            data.len()
        );
        Ok(u16::try_from(data.len() / block_size)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lun::{LogicalUnit, RamDisk};
    use crate::scsi::sense::{AscAscq, SenseKey};
    use crate::usb::ProtocolError;
    use crate::usb::function::MassStorageFunction;
    use crate::usb::gadget::{FunctionConfig, endpoints, serve};

    async fn start(
        units: Vec<Box<dyn LogicalUnit>>,
    ) -> (
        UsbDrive,
        tokio::task::JoinHandle<Result<MassStorageFunction>>,
    ) {
        let function = MassStorageFunction::new(units).unwrap();
        let (host, device) = endpoints(&FunctionConfig::default()).unwrap();
        let served = tokio::spawn(serve(function, device));
        (UsbDrive::open(host).await.unwrap(), served)
    }

    fn disk(blocks: u32) -> Box<dyn LogicalUnit> {
        Box::new(RamDisk::new(512, blocks).unwrap())
    }

    #[tokio::test]
    async fn initialization_discovers_every_lun() {
        let (drive, _served) = start(vec![disk(64), disk(128)]).await;
        assert_eq!(drive.luns().len(), 2);
        assert_eq!(drive.luns()[0].block_count(), 64);
        assert_eq!(drive.luns()[1].block_count(), 128);
        assert_eq!(drive.luns()[1].block_size(), 512);
        assert!(drive.luns()[0].inquiry.is_removable());
    }

    #[tokio::test]
    async fn write_then_read_back_across_transfers() {
        let (mut drive, served) = start(vec![disk(64)]).await;
        let data: Vec<u8> = (0..16 * 512).map(|i| (i % 251) as u8).collect();
        drive.write(0, 10, &data).await.unwrap();
        assert_eq!(drive.read(0, 10, 16).await.unwrap(), data);
        drive.verify(0, 10, &data).await.unwrap();

        drop(drive);
        let function = served.await.unwrap().unwrap();
        assert!(function.is_idle());
    }

    #[tokio::test]
    async fn luns_are_independent() {
        let (mut drive, _served) = start(vec![disk(8), disk(8)]).await;
        drive.write(1, 0, &[0xee; 512]).await.unwrap();
        assert_eq!(drive.read(0, 0, 1).await.unwrap(), vec![0; 512]);
        assert_eq!(drive.read(1, 0, 1).await.unwrap(), vec![0xee; 512]);
    }

    #[tokio::test]
    async fn failed_command_reports_sense() {
        let (mut drive, _served) = start(vec![disk(8)]).await;
        let err = drive.read(0, 8, 1).await.unwrap_err();
        assert!(err.to_string().contains("21/00"), "{err}");

        // the sense survives until another command succeeds
        let sense = drive.request_sense(0).await.unwrap();
        assert_eq!(sense.sense_key(), SenseKey::IllegalRequest as u8);
        assert_eq!(sense.asc_ascq(), AscAscq::LBA_OUT_OF_RANGE);
    }

    #[tokio::test]
    async fn miscompare_fails_verify() {
        let (mut drive, _served) = start(vec![disk(8)]).await;
        drive.write(0, 2, &[1; 512]).await.unwrap();
        let err = drive.verify(0, 2, &[2; 512]).await.unwrap_err();
        assert!(err.to_string().contains("1d/00"), "{err}");
        let sense = drive.request_sense(0).await.unwrap();
        assert_eq!(sense.sense_key(), SenseKey::Miscompare as u8);
    }

    #[tokio::test]
    async fn phase_error_is_recovered_with_a_reset() {
        let (mut drive, _served) = start(vec![disk(8)]).await;
        let mut read = command::read10(0, 1, 512);
        read.data_transfer_len = 2048;
        let err = drive.command(0, &read, None).await.unwrap_err();
        assert!(err.to_string().contains("phase error"), "{err}");
        assert_eq!(drive.read(0, 0, 1).await.unwrap().len(), 512);
    }

    #[tokio::test]
    async fn stalled_function_recovers_after_reset() {
        let (mut drive, _served) = start(vec![disk(8)]).await;
        drive.port.write(&[0xff; 31]).await.unwrap();
        let err = drive.port.read().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ProtocolError>(), Some(&ProtocolError::Stalled));

        drive.reset().await.unwrap();
        let data = drive.read(0, 0, 1).await.unwrap();
        assert_eq!(data.len(), 512);
        assert_eq!(drive.get_max_lun().await.unwrap(), 0);
    }
}
