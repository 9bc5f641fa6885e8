//! 重采样模块
//!
//! 插在解码器和 Ring Buffer 之间，处理交错的有符号 16-bit 主机字节序样本：
//! - 设备采样率 ≠ 解码采样率
//! - 用户变速（pitch）
//! - 软件音量（左右声道独立增益，饱和而非回绕）

mod linear;

pub use linear::LinearResampler;

/// 重采样器特征
pub trait Resampler: Send {
    /// 处理样本
    ///
    /// input: 输入样本（交错格式，整帧）
    /// output: 追加输出
    /// 返回: 实际追加的样本数
    fn process(&mut self, input: &[i16], output: &mut Vec<i16>) -> usize;

    /// 重置状态（flush 后调用，丢弃跨调用保留的尾部帧）
    fn reset(&mut self);

    /// 获取输入/输出采样率比
    fn ratio(&self) -> f64;

    /// 修改输入/输出采样率比
    fn set_ratio(&mut self, ratio: f64);

    /// 左右声道增益
    fn set_gain(&mut self, left: f32, right: f32);

    /// 比率为 1.0 且增益为 1.0 时可以整体旁路
    fn is_identity(&self) -> bool;

    /// 字节接口：输入输出都是主机字节序的 S16
    ///
    /// 末尾不足一个样本的字节被忽略。`scratch` 由调用方持有，稳态下不分配
    fn process_bytes(
        &mut self,
        input: &[u8],
        scratch: &mut SampleScratch,
        output: &mut Vec<u8>,
    ) -> usize {
        scratch.input.clear();
        scratch.input.extend(
            input
                .chunks_exact(2)
                .map(|b| i16::from_ne_bytes([b[0], b[1]])),
        );
        scratch.output.clear();
        let produced = self.process(&scratch.input, &mut scratch.output);

        output.reserve(produced * 2);
        for sample in &scratch.output {
            output.extend_from_slice(&sample.to_ne_bytes());
        }
        produced * 2
    }
}

/// `process_bytes` 的样本中间缓冲
#[derive(Debug, Default)]
pub struct SampleScratch {
    input: Vec<i16>,
    output: Vec<i16>,
}
