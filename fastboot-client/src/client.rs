use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use sparse_image::stream::ImageStream;

use crate::devinfo::DeviceInfo;
use crate::error::{Error, Result};
use crate::progress::{Progress, ProgressReporter, Stage};
use crate::protocol::{
    parse_var_u64, FastbootCommand, FastbootResponse, ResponseParseError, MAX_COMMAND_LEN,
};
use crate::transport::{Transport, TransportError};

/// Assumed `max-download-size` when the device does not report one
///
/// A heuristic carried over from common bootloaders, not a protocol
/// guarantee; the fallback is logged when taken.
pub const DEFAULT_MAX_DOWNLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// Upper bound for a single reply transfer
const MAX_REPLY_LEN: usize = 512;
/// Timeout for command and status replies
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout per DATA phase bulk transfer and for flash/erase completion
const DATA_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for reboot style commands
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cooperative cancellation flag
///
/// Cloned tokens share the flag. The client consults it before sending a
/// command and between DATA phase submissions; an in-flight transfer is
/// never torn down, the cancel takes effect at the next suspension point.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fastboot session over a claimed transport
///
/// The client owns the transport exclusively and serializes commands; a
/// second operation only starts after the previous terminal reply. Fatal
/// faults latch the session into a refusing state until
/// [FastbootClient::disconnect].
pub struct FastbootClient {
    transport: Option<Box<dyn Transport>>,
    vars: HashMap<String, String>,
    max_download_size: u64,
    healthy: bool,
    cancel: CancelToken,
}

impl FastbootClient {
    /// Create a client over an open transport without any I/O
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            vars: HashMap::new(),
            max_download_size: DEFAULT_MAX_DOWNLOAD_SIZE,
            healthy: true,
            cancel: CancelToken::new(),
        }
    }

    /// Create a client and populate the variable cache from the device
    pub async fn connect(transport: Box<dyn Transport>) -> Result<Self> {
        let mut client = Self::new(transport);
        client.refresh_vars().await?;
        Ok(client)
    }

    /// Token cancelling this client's operations
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether a transport is attached
    ///
    /// Still true after a fatal fault; operations then fail with
    /// [Error::NotConnected] until [Self::disconnect] drops the link.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Close and drop the transport
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.healthy = true;
    }

    /// Latch fatal errors; a cancel closes the link as the device state is
    /// indeterminate
    async fn absorb<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(e, Error::Cancelled) {
                debug!("Cancelled, closing the transport");
                self.disconnect().await;
            } else if e.is_fatal() {
                warn!("Session unusable: {e}");
                self.healthy = false;
            }
        }
        result
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        if !self.healthy {
            return Err(Error::NotConnected);
        }
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn send_command<S: Display>(&mut self, cmd: FastbootCommand<S>) -> Result<()> {
        self.check_cancelled()?;
        let cmd = cmd.to_string();
        if cmd.len() > MAX_COMMAND_LEN {
            return Err(Error::CommandTooLong(cmd));
        }
        trace!("Sending command: {cmd}");
        let transport = self.transport_mut()?;
        transport.write(cmd.as_bytes(), STATUS_TIMEOUT).await?;
        Ok(())
    }

    async fn read_response(&mut self, timeout: Duration) -> Result<FastbootResponse> {
        self.check_cancelled()?;
        let transport = self.transport_mut()?;
        let bytes = transport.read(MAX_REPLY_LEN, timeout).await?;
        let response = FastbootResponse::from_bytes(&bytes)?;
        trace!("Response: {:?}", response);
        Ok(response)
    }

    async fn handle_responses(&mut self, timeout: Duration) -> Result<String> {
        loop {
            match self.read_response(timeout).await? {
                FastbootResponse::Info(i) => info!("Device: {i}"),
                FastbootResponse::Text(t) => info!("Device text: {t}"),
                FastbootResponse::Data(_) => return Err(Error::UnexpectedReply),
                FastbootResponse::Okay(value) => return Ok(value),
                FastbootResponse::Fail(message) => return Err(Error::DeviceRejected { message }),
            }
        }
    }

    async fn execute<S: Display>(
        &mut self,
        cmd: FastbootCommand<S>,
        timeout: Duration,
    ) -> Result<String> {
        self.send_command(cmd).await?;
        self.handle_responses(timeout).await
    }

    async fn run<S: Display>(
        &mut self,
        cmd: FastbootCommand<S>,
        timeout: Duration,
    ) -> Result<String> {
        let r = self.execute(cmd, timeout).await;
        self.absorb(r).await
    }

    /// Get the named variable
    ///
    /// The "all" variable is special; for that [Self::get_var_all] should
    /// be used instead
    pub async fn get_var(&mut self, var: &str) -> Result<String> {
        self.run(FastbootCommand::GetVar(var), STATUS_TIMEOUT).await
    }

    /// Retrieve all variables
    pub async fn get_var_all(&mut self) -> Result<HashMap<String, String>> {
        let r = self.get_var_all_inner().await;
        self.absorb(r).await
    }

    async fn get_var_all_inner(&mut self) -> Result<HashMap<String, String>> {
        self.send_command(FastbootCommand::GetVar("all")).await?;
        let mut vars = HashMap::new();
        loop {
            match self.read_response(STATUS_TIMEOUT).await? {
                FastbootResponse::Info(i) => {
                    let Some((key, value)) = i.rsplit_once(':') else {
                        warn!("Failed to parse variable: {i}");
                        continue;
                    };
                    vars.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
                }
                FastbootResponse::Text(t) => info!("Device text: {t}"),
                FastbootResponse::Data(_) => return Err(Error::UnexpectedReply),
                FastbootResponse::Okay(_) => return Ok(vars),
                FastbootResponse::Fail(message) => return Err(Error::DeviceRejected { message }),
            }
        }
    }

    /// Refresh the variable cache with a getvar:all round trip
    pub async fn refresh_vars(&mut self) -> Result<()> {
        let vars = self.get_var_all().await?;
        self.max_download_size = match vars
            .get("max-download-size")
            .and_then(|v| parse_var_u64(v))
        {
            Some(size) => size,
            None => {
                debug!(
                    "Device does not report max-download-size, assuming {} bytes",
                    DEFAULT_MAX_DOWNLOAD_SIZE
                );
                DEFAULT_MAX_DOWNLOAD_SIZE
            }
        };
        self.vars = vars;
        Ok(())
    }

    /// The variable cache from the last refresh; keys are lower-cased
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Case-insensitive lookup in the variable cache, without I/O
    pub fn cached_var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Largest single download the device accepts
    pub fn max_download_size(&self) -> u64 {
        self.max_download_size
    }

    /// Typed snapshot of the device's variables
    ///
    /// Triggers one refresh if the cache is empty; the snapshot itself
    /// never refreshes.
    pub async fn device_info(&mut self) -> Result<DeviceInfo> {
        if self.vars.is_empty() {
            self.refresh_vars().await?;
        }
        Ok(DeviceInfo::from_vars(&self.vars))
    }

    /// Flash previously downloaded data to a target partition
    pub async fn flash(&mut self, target: &str) -> Result<()> {
        self.run(FastbootCommand::Flash(target), DATA_TIMEOUT)
            .await
            .map(|v| {
                trace!("Flash ok: {v}");
            })
    }

    /// Erase the given target partition
    pub async fn erase(&mut self, target: &str) -> Result<()> {
        self.run(FastbootCommand::Erase(target), DATA_TIMEOUT)
            .await
            .map(|v| {
                trace!("Erase ok: {v}");
            })
    }

    /// Select the active slot ("a" or "b")
    pub async fn set_active(&mut self, slot: &str) -> Result<()> {
        self.run(FastbootCommand::SetActive(slot), STATUS_TIMEOUT)
            .await
            .map(|v| {
                trace!("Set active ok: {v}");
            })
    }

    /// Unlock flashing; many devices wipe user data and confirm on screen
    pub async fn flashing_unlock(&mut self) -> Result<()> {
        self.run(FastbootCommand::<&str>::FlashingUnlock, STATUS_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Lock flashing again
    pub async fn flashing_lock(&mut self) -> Result<()> {
        self.run(FastbootCommand::<&str>::FlashingLock, STATUS_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Run a vendor specific command
    ///
    /// Returns the device's INFO output followed by the terminal message,
    /// newline separated.
    pub async fn oem(&mut self, cmd: &str) -> Result<String> {
        let r = self.oem_inner(cmd).await;
        self.absorb(r).await
    }

    async fn oem_inner(&mut self, cmd: &str) -> Result<String> {
        self.send_command(FastbootCommand::Oem(cmd)).await?;
        let mut output = String::new();
        loop {
            match self.read_response(STATUS_TIMEOUT).await? {
                FastbootResponse::Info(i) => {
                    info!("Device: {i}");
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&i);
                }
                FastbootResponse::Text(t) => info!("Device text: {t}"),
                FastbootResponse::Data(_) => return Err(Error::UnexpectedReply),
                FastbootResponse::Okay(value) => {
                    if !value.is_empty() {
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(&value);
                    }
                    return Ok(output);
                }
                FastbootResponse::Fail(message) => return Err(Error::DeviceRejected { message }),
            }
        }
    }

    async fn command_then_disconnect(&mut self, cmd: FastbootCommand<&str>) -> Result<()> {
        let r = self.execute(cmd, REBOOT_TIMEOUT).await;
        let value = self.absorb(r).await?;
        trace!("Ok: {value}");
        // The device drops off the bus after acknowledging
        self.disconnect().await;
        Ok(())
    }

    /// Reboot the device
    pub async fn reboot(&mut self) -> Result<()> {
        self.command_then_disconnect(FastbootCommand::Reboot).await
    }

    /// Reboot the device to the bootloader
    pub async fn reboot_bootloader(&mut self) -> Result<()> {
        self.command_then_disconnect(FastbootCommand::RebootBootloader)
            .await
    }

    /// Reboot the device to userspace fastboot
    pub async fn reboot_fastboot(&mut self) -> Result<()> {
        self.command_then_disconnect(FastbootCommand::RebootFastboot)
            .await
    }

    /// Reboot the device to recovery
    pub async fn reboot_recovery(&mut self) -> Result<()> {
        self.command_then_disconnect(FastbootCommand::RebootRecovery)
            .await
    }

    /// Continue the boot process
    pub async fn fb_continue(&mut self) -> Result<()> {
        self.command_then_disconnect(FastbootCommand::Continue).await
    }

    /// Download bytes into the device's staging buffer
    pub async fn download(&mut self, data: &[u8]) -> Result<()> {
        self.download_with(data, |_, _| ()).await
    }

    /// Download with a callback receiving cumulative sent and total bytes
    pub async fn download_with<F>(&mut self, data: &[u8], progress: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        let r = self.download_inner(data, progress).await;
        self.absorb(r).await
    }

    async fn download_inner<F>(&mut self, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        let size = u32::try_from(data.len()).map_err(|_| Error::ImageTooLarge {
            size: data.len() as u64,
            max: u64::from(u32::MAX),
        })?;
        self.send_command(FastbootCommand::<&str>::Download(size))
            .await?;
        loop {
            match self.read_response(STATUS_TIMEOUT).await? {
                FastbootResponse::Info(i) => info!("Device: {i}"),
                FastbootResponse::Text(t) => info!("Device text: {t}"),
                FastbootResponse::Data(accepted) => {
                    if accepted != size {
                        return Err(Error::Protocol(ResponseParseError::BadDataLength(format!(
                            "device accepted {accepted:#x} bytes for a {size:#x} byte download"
                        ))));
                    }
                    break;
                }
                FastbootResponse::Okay(_) => return Err(Error::UnexpectedReply),
                FastbootResponse::Fail(message) => return Err(Error::DeviceRejected { message }),
            }
        }

        let total = data.len() as u64;
        let chunk_size = self.transport_mut()?.max_transfer_size();
        let mut sent = 0u64;
        for chunk in data.chunks(chunk_size) {
            self.check_cancelled()?;
            let transport = self.transport_mut()?;
            let mut offset = 0;
            while offset < chunk.len() {
                let n = transport.write(&chunk[offset..], DATA_TIMEOUT).await?;
                if n == 0 {
                    return Err(Error::Transport(TransportError::Io(
                        "short bulk write".into(),
                    )));
                }
                offset += n;
            }
            sent += chunk.len() as u64;
            progress(sent, total);
        }

        self.handle_responses(STATUS_TIMEOUT).await.map(|v| {
            trace!("Download ok: {v}");
        })
    }

    /// Flash an image file to a partition
    ///
    /// Sparse images are streamed in sub-images sized to the device's
    /// max-download-size; non-sparse images go up in one download and must
    /// fit it. Progress is delivered to the callback throughout; the final
    /// record is `Done` at 100% exactly when flashing succeeded.
    pub async fn flash_partition<F>(
        &mut self,
        partition: &str,
        image: &Path,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(Progress),
    {
        let mut reporter = ProgressReporter::new(partition, 0, 1);
        match self
            .flash_partition_inner(partition, image, &mut reporter, &mut progress)
            .await
        {
            Ok(()) => {
                info!("Flashed {partition}");
                progress(reporter.snapshot(Stage::Done));
                Ok(())
            }
            Err(e) => {
                warn!("Flashing {partition} failed: {e}");
                progress(reporter.snapshot(Stage::Failed));
                Err(e)
            }
        }
    }

    async fn flash_partition_inner<F>(
        &mut self,
        partition: &str,
        image: &Path,
        reporter: &mut ProgressReporter,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(Progress),
    {
        if self.transport.is_none() || !self.healthy {
            return Err(Error::NotConnected);
        }
        let total_bytes = std::fs::metadata(image)?.len();
        let max = self.max_download_size;
        reporter.set_totals(total_bytes, 1);
        progress(reporter.snapshot(Stage::Preparing));

        let mut stream = ImageStream::open(image)?;
        if !stream.is_sparse() && stream.total_out_bytes() > max {
            return Err(Error::ImageTooLarge {
                size: stream.total_out_bytes(),
                max,
            });
        }
        let chunk_estimate = stream.total_out_bytes().div_ceil(max.max(1)).max(1);
        reporter.set_totals(total_bytes, chunk_estimate.min(u64::from(u32::MAX)) as u32);
        debug!(
            "Flashing {partition} from {}: {} bytes expanded, around {chunk_estimate} parts",
            image.display(),
            stream.total_out_bytes()
        );

        let mut chunk = 0u32;
        while let Some(sub) = stream.next_sub_image(max)? {
            chunk += 1;
            reporter.begin_chunk(chunk);
            progress(reporter.snapshot(Stage::Sending));

            let done_before = reporter.bytes_sent();
            self.download_with(&sub, |sent, _| {
                reporter.advance(done_before + sent);
                progress(reporter.snapshot(Stage::Sending));
            })
            .await?;

            progress(reporter.snapshot(Stage::Writing));
            self.flash(partition).await?;
        }
        Ok(())
    }
}
